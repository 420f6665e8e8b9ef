use crate::repository::{check_write, SessionRepository};
use crate::session::Session;
use async_trait::async_trait;
use keystone_core::{FenceToken, KeystoneError, KeystoneResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
struct StoredSession {
    /// Highest fence accepted for this session.
    fence: FenceToken,
    session: Session,
}

/// File-based session repository (one JSON file per session).
///
/// Writes within one process serialise through a mutex and land via
/// write-to-temp then rename, so a reader never sees a half-written file.
pub struct FileSessionRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionRepository {
    /// Open (creating if needed) a repository rooted at `dir`.
    pub async fn new(dir: PathBuf) -> KeystoneResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_record(&self, id: Uuid) -> KeystoneResult<Option<StoredSession>> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let record: StoredSession = serde_json::from_str(&data)?;
        Ok(Some(record))
    }

    async fn write_record(&self, record: &StoredSession) -> KeystoneResult<()> {
        let path = self.session_path(record.session.id);
        let tmp = self.dir.join(format!("{}.json.tmp", record.session.id));
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn load(&self, id: Uuid) -> KeystoneResult<Option<Session>> {
        Ok(self.read_record(id).await?.map(|r| r.session))
    }

    async fn create(&self, session: &Session) -> KeystoneResult<u64> {
        let _write = self.write_lock.lock().await;
        if self.read_record(session.id).await?.is_some() {
            return Err(KeystoneError::AlreadyExists(session.id));
        }
        let mut stored = session.clone();
        stored.version = 1;
        self.write_record(&StoredSession {
            fence: FenceToken::ZERO,
            session: stored,
        })
        .await?;
        tracing::debug!(session_id = %session.id, "Session file created");
        Ok(1)
    }

    async fn save(
        &self,
        session: &Session,
        expected_version: u64,
        fence: FenceToken,
    ) -> KeystoneResult<u64> {
        let _write = self.write_lock.lock().await;
        let current = self
            .read_record(session.id)
            .await?
            .ok_or(KeystoneError::NotFound(session.id))?;
        check_write(
            session.id,
            current.session.version,
            current.fence,
            expected_version,
            fence,
        )?;
        let mut stored = session.clone();
        stored.version = expected_version + 1;
        self.write_record(&StoredSession {
            fence,
            session: stored,
        })
        .await?;
        Ok(expected_version + 1)
    }

    async fn list(&self) -> KeystoneResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::status::SessionEvent;
    use chrono::Utc;

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let mut session = Session::new(2, Utc::now());
        session
            .metadata
            .insert("owner".into(), serde_json::json!("batch-7"));
        repo.create(&session).await.unwrap();

        session.transition_to(SessionEvent::Start, Utc::now()).unwrap();
        session.add_checkpoint(serde_json::json!({"row": 10}), "progress", Utc::now());
        assert_eq!(repo.save(&session, 1, FenceToken(3)).await.unwrap(), 2);

        let loaded = repo.load(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.checkpoints.len(), 1);
        assert_eq!(loaded.metadata["owner"], "batch-7");
        assert_eq!(repo.list().await.unwrap(), vec![session.id]);
    }

    #[tokio::test]
    async fn test_fence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(0, Utc::now());
        {
            let repo = FileSessionRepository::new(dir.path().to_path_buf())
                .await
                .unwrap();
            repo.create(&session).await.unwrap();
            repo.save(&session, 1, FenceToken(9)).await.unwrap();
        }
        let repo = FileSessionRepository::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let err = repo.save(&session, 2, FenceToken(8)).await.unwrap_err();
        assert!(matches!(err, KeystoneError::StaleFence { .. }));
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
