use crate::state::KeyState;
use crate::store::{Lease, LeaseStore, Ticket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{FenceToken, KeystoneError, KeystoneResult, SharedClock};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lease store kept in a directory shared by every process on the host.
///
/// Each resource has a JSON state file holding its lease, fence high-water
/// mark, and ticket queue. Every operation takes an exclusive `flock` on the
/// resource's lock file, reads the state, applies the change, and lands the
/// new state via write-to-temp then rename before unlocking. Fence tokens
/// therefore keep increasing across processes and restarts.
///
/// On non-unix targets the `flock` step is skipped and the store is only safe
/// for a single process.
pub struct FileLeaseStore {
    dir: PathBuf,
    clock: SharedClock,
}

impl FileLeaseStore {
    /// Open (creating if needed) a lease directory at `dir`.
    pub async fn new(dir: PathBuf, clock: SharedClock) -> KeystoneResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, clock })
    }

    /// Run `op` on the key's state while holding its file lock.
    ///
    /// `op` returns its result and whether the state changed.
    async fn with_state<T, F>(&self, key: &str, op: F) -> KeystoneResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut KeyState, DateTime<Utc>) -> (T, bool) + Send + 'static,
    {
        let base = self.dir.join(file_stem(key));
        let clock = self.clock.clone();
        tokio::task::spawn_blocking(move || -> KeystoneResult<T> {
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(base.with_extension("lock"))?;
            flock_exclusive(&lock_file)?;

            let state_path = base.with_extension("json");
            let mut state = read_state(&state_path)?;
            let (result, dirty) = op(&mut state, clock.now());
            if dirty {
                write_state(&state_path, &state)?;
            }
            // Closing the descriptor releases the flock.
            drop(lock_file);
            Ok(result)
        })
        .await
        .map_err(|e| KeystoneError::Unavailable(format!("lease store task failed: {e}")))?
    }
}

/// Filesystem-safe name for a resource key.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            stem.push(c);
        } else {
            stem.push_str(&format!("%{:x}", c as u32));
        }
    }
    stem
}

fn read_state(path: &Path) -> KeystoneResult<KeyState> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(serde_json::from_str(&data)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(KeyState::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_state(path: &Path, state: &KeyState) -> KeystoneResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(state)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Block until an exclusive flock is held on `file`.
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: flock is a standard POSIX call. fd is a valid file
            // descriptor owned by `file` for the duration of the call.
            #[allow(unsafe_code)]
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        expected: Option<FenceToken>,
        holder_id: &str,
        queue_position: u64,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>> {
        let resource = key.to_string();
        let holder = holder_id.to_string();
        self.with_state(key, move |state, now| {
            let granted =
                state.compare_and_swap(&resource, now, expected, &holder, queue_position, ttl);
            let dirty = granted.is_some();
            (granted, dirty)
        })
        .await
    }

    async fn extend_ttl_if_owner(
        &self,
        key: &str,
        fence: FenceToken,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>> {
        self.with_state(key, move |state, now| {
            let extended = state.extend(now, fence, ttl);
            let dirty = extended.is_some();
            (extended, dirty)
        })
        .await
    }

    async fn delete_if_owner(&self, key: &str, fence: FenceToken) -> KeystoneResult<bool> {
        self.with_state(key, move |state, now| {
            let removed = state.delete(now, fence);
            (removed, removed)
        })
        .await
    }

    async fn get(&self, key: &str) -> KeystoneResult<Option<Lease>> {
        self.with_state(key, |state, now| (state.live_lease(now).cloned(), false))
            .await
    }

    async fn enqueue_ticket(
        &self,
        key: &str,
        holder_id: &str,
        deadline: DateTime<Utc>,
    ) -> KeystoneResult<Ticket> {
        let holder = holder_id.to_string();
        self.with_state(key, move |state, now| {
            (state.enqueue(now, &holder, deadline), true)
        })
        .await
    }

    async fn ticket_position(&self, key: &str, ticket_id: u64) -> KeystoneResult<Option<usize>> {
        self.with_state(key, move |state, now| {
            (state.ticket_position(now, ticket_id), true)
        })
        .await
    }

    async fn remove_ticket(&self, key: &str, ticket_id: u64) -> KeystoneResult<bool> {
        self.with_state(key, move |state, _| {
            let removed = state.remove_ticket(ticket_id);
            (removed, removed)
        })
        .await
    }

    async fn queue_len(&self, key: &str) -> KeystoneResult<usize> {
        self.with_state(key, |state, now| (state.queue_len(now), true))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::fair_lock::{FairLock, LockConfig};
    use keystone_core::{Clock, ManualClock};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_millis(500);

    async fn open(dir: &Path, clock: &Arc<ManualClock>) -> FileLeaseStore {
        FileLeaseStore::new(dir.to_path_buf(), clock.clone())
            .await
            .unwrap()
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        assert_eq!(file_stem("session-1_a"), "session-1_a");
        assert_eq!(file_stem("a/b"), "a%2fb");
        assert_ne!(file_stem("a.b"), file_stem("a_b"));
    }

    #[tokio::test]
    async fn test_stores_sharing_a_directory_see_one_lease() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let first = open(dir.path(), &clock).await;
        let second = open(dir.path(), &clock).await;

        let lease = first
            .compare_and_swap_with_ttl("s", None, "a", 0, TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(second
            .compare_and_swap_with_ttl("s", None, "b", 0, TTL)
            .await
            .unwrap()
            .is_none());
        assert_eq!(second.get("s").await.unwrap(), Some(lease.clone()));

        assert!(!second.delete_if_owner("s", FenceToken(9)).await.unwrap());
        assert!(second.delete_if_owner("s", lease.fence_token).await.unwrap());
        let next = second
            .compare_and_swap_with_ttl("s", None, "b", 0, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.fence_token, FenceToken(2));
    }

    #[tokio::test]
    async fn test_fences_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        {
            let store = open(dir.path(), &clock).await;
            for _ in 0..3 {
                let lease = store
                    .compare_and_swap_with_ttl("s", None, "a", 0, TTL)
                    .await
                    .unwrap()
                    .unwrap();
                store.delete_if_owner("s", lease.fence_token).await.unwrap();
            }
        }

        let reopened = open(dir.path(), &clock).await;
        let lease = reopened
            .compare_and_swap_with_ttl("s", None, "b", 0, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.fence_token, FenceToken(4));
    }

    #[tokio::test]
    async fn test_ticket_queue_is_shared_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let first = open(dir.path(), &clock).await;
        let second = open(dir.path(), &clock).await;
        let now = clock.now();

        let t1 = first
            .enqueue_ticket("s", "a", now + chrono::Duration::milliseconds(100))
            .await
            .unwrap();
        let t2 = second
            .enqueue_ticket("s", "b", now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(t2.position, 1);
        assert_eq!(second.ticket_position("s", t1.id).await.unwrap(), Some(0));

        clock.advance(Duration::from_millis(150));
        assert_eq!(first.ticket_position("s", t2.id).await.unwrap(), Some(0));
        assert!(first.remove_ticket("s", t2.id).await.unwrap());
        assert_eq!(second.queue_len("s").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locks_over_one_directory_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let config = LockConfig {
            poll_interval_ms: 5,
            ..LockConfig::default()
        };
        let mut locks = Vec::new();
        for _ in 0..2 {
            locks.push(Arc::new(FairLock::new(
                Arc::new(open(dir.path(), &clock).await),
                clock.clone(),
                config.clone(),
                CircuitBreakerConfig::default(),
            )));
        }

        let held = locks[0]
            .acquire("s", "a", Duration::from_millis(100), TTL)
            .await
            .unwrap();
        let waiter = {
            let lock = locks[1].clone();
            tokio::spawn(async move {
                lock.acquire("s", "b", Duration::from_secs(5), TTL).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        locks[0].release_guard(held).await.unwrap();
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.holder_id(), "b");
        assert_eq!(guard.fence(), FenceToken(2));
    }
}
