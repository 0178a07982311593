use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ExternalId);
id_newtype!(SenderId);
id_newtype!(TargetId);

/// One item pulled from a channel, in the channel's natural order.
///
/// `title` is set only by title-bearing channels (mail, reminders);
/// `target` is where a reply for this item should be written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelItem {
    pub external_id: ExternalId,
    pub sender: SenderId,
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub target: Option<TargetId>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Result of one poll: ordered items plus the cursor to persist once every
/// item has been handed off.
#[derive(Debug, Clone, Default)]
pub struct ChannelBatch {
    pub items: Vec<ChannelItem>,
    pub next_cursor: Option<String>,
}
