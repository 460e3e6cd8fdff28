//! Session persistence backends
//!
//! One record per session id. The file backend writes to a temporary sibling
//! and renames it into place, so a crash mid-write leaves the previous record
//! intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::types::SessionState;
use crate::error::{ClassifiedError, ErrorCategory, RecoveryStrategy, Severity};

/// Error type for session store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session record {session_id} is corrupted: {message}")]
    Corrupted { session_id: String, message: String },

    #[error("Invalid session id {session_id:?}")]
    InvalidId { session_id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            Self::Io { path, source } => {
                let (severity, recoverable, strategy) = match source.kind() {
                    std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut => {
                        (Severity::Low, true, RecoveryStrategy::Retry)
                    }
                    std::io::ErrorKind::PermissionDenied => {
                        (Severity::Medium, false, RecoveryStrategy::UserIntervention)
                    }
                    _ => (Severity::Medium, true, RecoveryStrategy::Skip),
                };
                ClassifiedError::new(
                    ErrorCategory::Filesystem,
                    severity,
                    recoverable,
                    strategy,
                    message,
                )
                .with_context("path", path.display().to_string())
                .with_suggestion("Check that the state directory exists and is writable")
            }
            Self::Corrupted { session_id, .. } => ClassifiedError::new(
                ErrorCategory::Session,
                Severity::Low,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_context("session_id", session_id.clone())
            .with_suggestion("A fresh session is created; the corrupted record is overwritten"),
            Self::InvalidId { session_id } => ClassifiedError::new(
                ErrorCategory::Session,
                Severity::Medium,
                false,
                RecoveryStrategy::UserIntervention,
                message,
            )
            .with_context("session_id", session_id.clone())
            .with_suggestion("Session ids may only contain letters, digits, '-', '_' and '.'"),
            Self::Serialization(_) => ClassifiedError::new(
                ErrorCategory::Filesystem,
                Severity::High,
                false,
                RecoveryStrategy::Abort,
                message,
            ),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable home for session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session; `Ok(None)` when no record exists
    async fn load(&self, session_id: &str) -> StoreResult<Option<SessionState>>;

    /// Replace the record for `state.session_id`
    async fn save(&self, state: &SessionState) -> StoreResult<()>;

    /// All known session ids, sorted
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Shared reference to a session store
pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Reject ids that could escape the state directory or pass for a temp file
pub fn validate_session_id(session_id: &str) -> StoreResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId {
            session_id: session_id.to_string(),
        })
    }
}

fn decode(session_id: &str, json: &str) -> StoreResult<SessionState> {
    let state: SessionState =
        serde_json::from_str(json).map_err(|e| StoreError::Corrupted {
            session_id: session_id.to_string(),
            message: e.to_string(),
        })?;
    if state.session_id != session_id {
        return Err(StoreError::Corrupted {
            session_id: session_id.to_string(),
            message: format!("record belongs to session {}", state.session_id),
        });
    }
    state
        .check_invariants()
        .map_err(|message| StoreError::Corrupted {
            session_id: session_id.to_string(),
            message,
        })?;
    Ok(state)
}

/// JSON-file-per-session store
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> StoreResult<Option<SessionState>> {
        validate_session_id(session_id)?;
        let path = self.path_for(session_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        decode(session_id, &json).map(Some)
    }

    async fn save(&self, state: &SessionState) -> StoreResult<()> {
        validate_session_id(&state.session_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.path_for(&state.session_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            state.session_id,
            uuid::Uuid::new_v4().simple()
        ));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(&path, e));
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-process store, keyed by session id
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record with raw text (tests use this to simulate corruption)
    pub async fn put_raw(&self, session_id: &str, raw: impl Into<String>) {
        self.records
            .write()
            .await
            .insert(session_id.to_string(), raw.into());
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> StoreResult<Option<SessionState>> {
        validate_session_id(session_id)?;
        let records = self.records.read().await;
        match records.get(session_id) {
            Some(json) => decode(session_id, json).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &SessionState) -> StoreResult<()> {
        validate_session_id(&state.session_id)?;
        // Stored serialised so loads go through the same validation as files
        let json = serde_json::to_string(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.records
            .write()
            .await
            .insert(state.session_id.clone(), json);
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SessionConfig;
    use chrono::Utc;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("audit-42_b.v2").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("a/b").is_err());
        // dot-prefixed names are reserved for temp files and skipped by list()
        assert!(validate_session_id(".a").is_err());
        assert!(validate_session_id(".").is_err());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions"));

        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        let state = SessionState::new("s1", SessionConfig::for_task("t"), Utc::now());
        store.save(&state).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.list().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();

        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
        let classified = err.classify();
        assert_eq!(classified.category, ErrorCategory::Session);
        assert!(classified.recoverable);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_foreign_record() {
        let store = MemorySessionStore::new();
        let state = SessionState::new("other", SessionConfig::default(), Utc::now());
        store
            .put_raw("mine", serde_json::to_string(&state).unwrap())
            .await;
        assert!(matches!(
            store.load("mine").await,
            Err(StoreError::Corrupted { .. })
        ));
    }
}
