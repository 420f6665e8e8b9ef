use keystone_lock::{CircuitBreakerConfig, LockConfig};
use keystone_orchestrator::{OrchestratorConfig, RetryPolicy};
use keystone_session::HealthConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of `keystone.toml`.
#[derive(Debug, Deserialize)]
pub struct KeystoneConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock: LockConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            health: HealthConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl KeystoneConfig {
    /// Parse a TOML document.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load `path`, or fall back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&text)
    }

    /// Directory holding one JSON file per session.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding lease and fence state shared by every CLI process.
    pub fn leases_dir(&self) -> PathBuf {
        self.data_dir.join("leases")
    }
}
