//! Durable audit sessions: data model, persistence, and the manager that
//! serialises mutations per session id.

pub mod manager;
pub mod store;
pub mod types;

pub use manager::{
    record_outcome, stage_iteration, LoopOutcome, SessionLease, SessionManager, SessionOrigin,
    Staged,
};
pub use store::{
    FileSessionStore, MemorySessionStore, SessionStore, SharedSessionStore, StoreError,
    StoreResult,
};
pub use types::{AuditScope, IterationRecord, SessionConfig, SessionState};
