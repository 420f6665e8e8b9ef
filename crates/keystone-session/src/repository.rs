use crate::session::Session;
use async_trait::async_trait;
use keystone_core::{FenceToken, KeystoneError, KeystoneResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Durable storage for sessions.
///
/// `save` is the only write path for existing sessions and is guarded twice:
/// by the stored version (optimistic concurrency) and by the highest fence
/// token previously accepted for the id (so a writer whose lease was taken
/// over cannot overwrite its successor).
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Fetch the stored session, if any.
    async fn load(&self, id: Uuid) -> KeystoneResult<Option<Session>>;

    /// Store a brand-new session at version 1. Fails if the id already exists.
    async fn create(&self, session: &Session) -> KeystoneResult<u64>;

    /// Overwrite the session if the stored version equals `expected_version`
    /// and `fence` is not older than any fence accepted before. Returns the
    /// new version (`expected_version + 1`).
    async fn save(
        &self,
        session: &Session,
        expected_version: u64,
        fence: FenceToken,
    ) -> KeystoneResult<u64>;

    /// Ids of every stored session.
    async fn list(&self) -> KeystoneResult<Vec<Uuid>>;
}

/// Checks a write against the stored version and fence high-water mark.
pub(crate) fn check_write(
    id: Uuid,
    stored_version: u64,
    accepted_fence: FenceToken,
    expected_version: u64,
    fence: FenceToken,
) -> KeystoneResult<()> {
    if fence < accepted_fence {
        return Err(KeystoneError::StaleFence {
            id,
            presented: fence,
            accepted: accepted_fence,
        });
    }
    if stored_version != expected_version {
        return Err(KeystoneError::VersionConflict {
            id,
            expected: expected_version,
            actual: stored_version,
        });
    }
    Ok(())
}

struct Record {
    session: Session,
    fence: FenceToken,
}

/// Process-local repository.
#[derive(Default)]
pub struct InMemorySessionRepository {
    records: Mutex<HashMap<Uuid, Record>>,
}

impl InMemorySessionRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn load(&self, id: Uuid) -> KeystoneResult<Option<Session>> {
        Ok(self.records.lock().get(&id).map(|r| r.session.clone()))
    }

    async fn create(&self, session: &Session) -> KeystoneResult<u64> {
        let mut records = self.records.lock();
        if records.contains_key(&session.id) {
            return Err(KeystoneError::AlreadyExists(session.id));
        }
        let mut stored = session.clone();
        stored.version = 1;
        records.insert(
            session.id,
            Record {
                session: stored,
                fence: FenceToken::ZERO,
            },
        );
        Ok(1)
    }

    async fn save(
        &self,
        session: &Session,
        expected_version: u64,
        fence: FenceToken,
    ) -> KeystoneResult<u64> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&session.id)
            .ok_or(KeystoneError::NotFound(session.id))?;
        check_write(
            session.id,
            record.session.version,
            record.fence,
            expected_version,
            fence,
        )?;
        let mut stored = session.clone();
        stored.version = expected_version + 1;
        record.session = stored;
        record.fence = fence;
        Ok(expected_version + 1)
    }

    async fn list(&self) -> KeystoneResult<Vec<Uuid>> {
        Ok(self.records.lock().keys().copied().collect())
    }
}
