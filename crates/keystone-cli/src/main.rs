mod config;

use clap::{Parser, Subcommand};
use config::KeystoneConfig;
use keystone_core::{SharedClock, SystemClock};
use keystone_lock::{FairLock, FileLeaseStore};
use keystone_orchestrator::{
    retry_apply, HookChain, OrchestrationMetrics, OrchestrationService, Outcome, TracingHook,
};
use keystone_session::{FileSessionRepository, SessionEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "keystone", about = "Keystone: lock-guarded session orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "keystone.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new PENDING session
    Create {
        /// Scheduling priority
        #[arg(short, long, default_value_t = 0)]
        priority: u8,
        /// Metadata entries as key=value
        #[arg(short, long = "meta")]
        meta: Vec<String>,
    },
    /// Apply a lifecycle event (start, pause, complete, retry, ...)
    Apply {
        session_id: Uuid,
        event: SessionEvent,
        /// JSON payload recorded as a checkpoint after the transition
        #[arg(long)]
        payload: Option<String>,
        /// Lock acquisition timeout (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Retry conflicts and transient errors with backoff
        #[arg(long)]
        retry: bool,
    },
    /// Record a checkpoint
    Checkpoint {
        session_id: Uuid,
        /// JSON payload
        payload: String,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Print a session and its health score
    Show { session_id: Uuid },
    /// List stored session ids
    List,
    /// Orphan the session if its worker has gone quiet
    Recover { session_id: Uuid },
    /// Run concurrent workers against one session and print the metrics
    Simulate {
        #[arg(short, long, default_value_t = 4)]
        workers: u32,
        #[arg(short, long, default_value_t = 5)]
        steps: u32,
    },
}

fn parse_json(text: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| anyhow::anyhow!("Invalid JSON payload: {}", e))
}

fn parse_meta(entries: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let mut metadata = HashMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Metadata must be key=value, got '{}'", entry))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = KeystoneConfig::load(&cli.config).await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(FileLeaseStore::new(config.leases_dir(), clock.clone()).await?);
    let lock = Arc::new(FairLock::new(
        store,
        clock.clone(),
        config.lock.clone(),
        config.breaker.clone(),
    ));
    let repo = Arc::new(FileSessionRepository::new(config.sessions_dir()).await?);

    let metrics = Arc::new(OrchestrationMetrics::new());
    let mut hooks = HookChain::new();
    hooks.add(Arc::new(TracingHook));
    hooks.add(metrics.clone());

    let service = Arc::new(
        OrchestrationService::new(lock, repo, clock, config.orchestrator.clone())
            .with_hooks(hooks)
            .with_health_config(config.health.clone()),
    );
    let default_timeout = config.lock.acquire_timeout();

    match cli.command {
        Commands::Create { priority, meta } => {
            let session = service.create_session(priority, parse_meta(&meta)?).await?;
            print_json(&session)?;
        }
        Commands::Apply {
            session_id,
            event,
            payload,
            timeout_ms,
            retry,
        } => {
            let payload = payload.as_deref().map(parse_json).transpose()?;
            let timeout = timeout_ms.map_or(default_timeout, Duration::from_millis);
            let outcome = if retry {
                retry_apply(&service, &config.retry, session_id, event, payload, timeout).await
            } else {
                service.apply(session_id, event, payload, timeout).await
            };
            print_json(&outcome)?;
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Checkpoint {
            session_id,
            payload,
            reason,
        } => {
            let outcome = service
                .checkpoint(session_id, parse_json(&payload)?, reason, default_timeout)
                .await;
            print_json(&outcome)?;
        }
        Commands::Show { session_id } => match service.get_snapshot(session_id).await? {
            Some(session) => {
                let health = service.health(session_id).await?;
                print_json(&serde_json::json!({
                    "session": session,
                    "health": health,
                }))?;
            }
            None => anyhow::bail!("Session {} not found", session_id),
        },
        Commands::List => {
            for id in service.list_sessions().await? {
                println!("{}", id);
            }
        }
        Commands::Recover { session_id } => {
            let outcome = service.recover(session_id, default_timeout).await;
            print_json(&outcome)?;
        }
        Commands::Simulate { workers, steps } => {
            let session_id = service.create_session(0, HashMap::new()).await?.id;
            info!(session_id = %session_id, workers, steps, "Starting simulation");
            let first = service
                .apply(session_id, SessionEvent::Start, None, default_timeout)
                .await;
            if !first.is_success() {
                anyhow::bail!("Could not start simulated session: {:?}", first);
            }

            let mut handles = Vec::new();
            for worker in 0..workers {
                let service = service.clone();
                let policy = config.retry.clone();
                handles.push(tokio::spawn(async move {
                    let mut persisted = 0u32;
                    for step in 0..steps {
                        let outcome = keystone_orchestrator::retry_with(
                            &policy,
                            || {
                                service.checkpoint(
                                    session_id,
                                    serde_json::json!({ "worker": worker, "step": step }),
                                    format!("worker-{worker}"),
                                    default_timeout,
                                )
                            },
                            |ms| tokio::time::sleep(Duration::from_millis(ms)),
                        )
                        .await;
                        if let Outcome::Success { .. } = outcome {
                            persisted += 1;
                        }
                    }
                    persisted
                }));
            }
            let mut persisted = 0;
            for handle in handles {
                persisted += handle.await?;
            }

            service
                .apply(session_id, SessionEvent::Complete, None, default_timeout)
                .await;
            let final_state = service.get_snapshot(session_id).await?;
            print_json(&serde_json::json!({
                "session_id": session_id,
                "persisted_checkpoints": persisted,
                "final_version": final_state.as_ref().map(|s| s.version),
                "gapless": final_state.as_ref().map(|s| s.checkpoints_are_gapless()),
                "metrics": metrics.to_json().await,
            }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_accepts_json_and_strings() {
        let meta = parse_meta(&["team=\"infra\"".into(), "retries=3".into(), "owner=ana".into()])
            .unwrap();
        assert_eq!(meta["team"], "infra");
        assert_eq!(meta["retries"], 3);
        assert_eq!(meta["owner"], "ana");
        assert!(parse_meta(&["novalue".into()]).is_err());
    }

    #[test]
    fn test_cli_parses_apply() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "keystone",
            "apply",
            &id.to_string(),
            "complete-partially",
            "--payload",
            "{\"rows\":3}",
            "--retry",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply {
                session_id,
                event,
                retry,
                ..
            } => {
                assert_eq!(session_id, id);
                assert_eq!(event, SessionEvent::CompletePartially);
                assert!(retry);
            }
            _ => panic!("expected apply"),
        }
    }
}
