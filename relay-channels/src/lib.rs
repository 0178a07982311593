//! Channel adapters for relayd.
//!
//! Adapters are pure I/O: they pull items newer than a cursor from one
//! external channel store and push result text back into it. The native
//! Mail/Reminders/Notes/Calendar/Messaging wrappers live outside this repo
//! and are reached through the HTTP bridge adapter.

mod http_bridge;
mod traits;
mod types;

pub use http_bridge::HttpBridgeAdapter;
pub use traits::ChannelAdapter;
pub use types::{ChannelBatch, ChannelItem, ExternalId, SenderId, TargetId};
