use crate::types::ChannelBatch;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "messages", "mail", "reminders", "notes",
    /// "calendar".
    fn channel_id(&self) -> &str;

    /// Fetch items newer than `since_cursor`, in the channel's natural
    /// order. A `None` cursor means the channel has never been read.
    async fn poll(&self, since_cursor: Option<&str>) -> Result<ChannelBatch>;

    /// Deliver result text back into the originating channel.
    async fn write_result(&self, target_id: &str, text: &str) -> Result<()>;

    /// Whether items from this channel carry a title (mail subject,
    /// reminder name) in addition to the body.
    fn title_bearing(&self) -> bool {
        false
    }
}
