//! Execution connector boundary for relayd.
//!
//! The backend that actually performs requested work is an external,
//! swappable collaborator. This crate owns the calling contract — timeout,
//! cancellation, streaming progress — and ships two concrete connectors:
//! an opaque subprocess and an HTTP service.

mod error;
mod http;
mod subprocess;
mod traits;

pub use error::{ConnectorError, Result};
pub use http::HttpConnector;
pub use subprocess::SubprocessConnector;
pub use traits::{ExecutionConnector, ExecutionContext, ExecutionOutcome};
