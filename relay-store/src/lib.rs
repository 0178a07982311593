//! Durable store for relayd.
//!
//! One SQLite database owns every persisted row: sessions, inbound messages,
//! runs, approval requests, audit events, channel cursors, and daemon meta.
//! All other crates treat this as the single shared mutable resource.

mod error;
mod store;
mod types;

pub use error::{Result, StoreError};
pub use store::Store;
pub use types::{
    ApprovalRequest, ApprovalStatus, ApprovalTransition, AuditEvent, IngestOutcome,
    InboundMessage, NewInboundMessage, Run, RunState, Session, StoreMetrics,
};
