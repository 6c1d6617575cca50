//! Session persistence seam.
//!
//! The orchestration core only needs get / create / update-fields keyed by
//! session ID. [`MemorySessionStore`] is the in-process implementation used
//! by the CLI and tests.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pf_core::{Error, Result, SessionId};

use crate::types::{TranscodeRequest, TranscodeResult, TranscodeStatus, TranscodingProgress};

/// Everything recorded about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// [`TranscodeRequest::content_key`] of the originating request.
    pub request_key: String,
    pub provider: String,
    pub status: TranscodeStatus,
    pub request: TranscodeRequest,
    pub progress: Option<TranscodingProgress>,
    pub result: Option<TranscodeResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub directory_path: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub error: Option<String>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, provider: &str, request: TranscodeRequest) -> Self {
        Self {
            session_id,
            request_key: request.content_key(),
            provider: provider.to_string(),
            status: TranscodeStatus::Admitted,
            request,
            progress: None,
            result: None,
            start_time: Utc::now(),
            end_time: None,
            directory_path: None,
            content_hash: None,
            error: None,
        }
    }
}

/// A partial update. `None` fields are left untouched, and a status change
/// is ignored once the record has reached a terminal status.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<TranscodeStatus>,
    pub progress: Option<TranscodingProgress>,
    pub result: Option<TranscodeResult>,
    pub directory_path: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub error: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: TranscodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TranscodeStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn apply(self, record: &mut SessionRecord) {
        // Terminal statuses are final.
        if let Some(status) = self.status.filter(|_| !record.status.is_terminal()) {
            record.status = status;
            if status.is_terminal() {
                record.end_time = Some(Utc::now());
            }
        }
        if let Some(progress) = self.progress {
            record.progress = Some(progress);
        }
        if let Some(result) = self.result {
            record.result = Some(result);
        }
        if let Some(dir) = self.directory_path {
            record.directory_path = Some(dir);
        }
        if let Some(hash) = self.content_hash {
            record.content_hash = Some(hash);
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: SessionRecord) -> Result<()>;

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>>;

    /// Apply `update` and return the updated record.
    async fn update(&self, session_id: SessionId, update: SessionUpdate) -> Result<SessionRecord>;

    /// A live or completed session for the same output, if any.
    async fn find_by_request_key(&self, key: &str) -> Result<Option<SessionRecord>>;

    async fn list(&self) -> Result<Vec<SessionRecord>>;

    /// Forget a session. Returns the removed record, if there was one.
    async fn remove(&self, session_id: SessionId) -> Result<Option<SessionRecord>>;
}

/// [`SessionStore`] backed by a concurrent map.
#[derive(Default)]
pub struct MemorySessionStore {
    records: DashMap<SessionId, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, record: SessionRecord) -> Result<()> {
        if self.records.contains_key(&record.session_id) {
            return Err(Error::Storage(format!(
                "session {} already exists",
                record.session_id
            )));
        }
        self.records.insert(record.session_id, record);
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.records.get(&session_id).map(|r| r.value().clone()))
    }

    async fn update(&self, session_id: SessionId, update: SessionUpdate) -> Result<SessionRecord> {
        let mut record = self
            .records
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        update.apply(&mut record);
        Ok(record.clone())
    }

    async fn find_by_request_key(&self, key: &str) -> Result<Option<SessionRecord>> {
        let found = self
            .records
            .iter()
            .filter(|r| r.request_key == key)
            .filter(|r| {
                matches!(
                    r.status,
                    TranscodeStatus::Admitted | TranscodeStatus::Running | TranscodeStatus::Completed
                )
            })
            .max_by_key(|r| r.start_time)
            .map(|r| r.value().clone());
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut all: Vec<SessionRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.start_time);
        Ok(all)
    }

    async fn remove(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.records.remove(&session_id).map(|(_, record)| record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(media: &str) -> SessionRecord {
        SessionRecord::new(
            SessionId::new(),
            "ffmpeg",
            TranscodeRequest::new(media, format!("/m/{media}.mkv"), "mp4"),
        )
    }

    #[tokio::test]
    async fn create_get_update() {
        let store = MemorySessionStore::new();
        let r = record("a");
        let id = r.session_id;
        store.create(r.clone()).await.unwrap();
        assert!(store.create(r).await.is_err());

        let updated = store
            .update(id, SessionUpdate::status(TranscodeStatus::Running))
            .await
            .unwrap();
        assert_eq!(updated.status, TranscodeStatus::Running);
        assert!(updated.end_time.is_none());

        let failed = store.update(id, SessionUpdate::failed("boom")).await.unwrap();
        assert_eq!(failed.status, TranscodeStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.end_time.is_some());

        assert_eq!(store.get(id).await.unwrap().unwrap(), failed);

        let unchanged = store
            .update(id, SessionUpdate::status(TranscodeStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(unchanged.status, TranscodeStatus::Failed);
        assert_eq!(unchanged.end_time, failed.end_time);
        assert!(store.get(SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_unknown_session_is_not_found() {
        let store = MemorySessionStore::new();
        let err = store
            .update(SessionId::new(), SessionUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), pf_core::ErrorKind::Session);
    }

    #[tokio::test]
    async fn request_key_lookup_skips_failed_sessions() {
        let store = MemorySessionStore::new();
        let failed = record("a");
        let key = failed.request_key.clone();
        let failed_id = failed.session_id;
        store.create(failed).await.unwrap();
        store.update(failed_id, SessionUpdate::failed("x")).await.unwrap();
        assert!(store.find_by_request_key(&key).await.unwrap().is_none());

        let live = record("a");
        let live_id = live.session_id;
        store.create(live).await.unwrap();
        store
            .update(live_id, SessionUpdate::status(TranscodeStatus::Running))
            .await
            .unwrap();
        let found = store.find_by_request_key(&key).await.unwrap().unwrap();
        assert_eq!(found.session_id, live_id);

        store.create(record("b")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 3);

        let removed = store.remove(live_id).await.unwrap().unwrap();
        assert_eq!(removed.session_id, live_id);
        assert!(store.find_by_request_key(&key).await.unwrap().is_none());
        assert!(store.remove(live_id).await.unwrap().is_none());
    }
}
