use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
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

id_newtype!(SessionId);
id_newtype!(WorkflowId);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// References carried between turns by the transport.
///
/// The engine only reads this; transports update it from
/// [`crate::TurnReply::referenced_items`] and their own focus commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub last_referenced_item_id: Option<String>,
    #[serde(default)]
    pub last_thread_or_group_id: Option<String>,
    #[serde(default)]
    pub pending_workflow_id: Option<WorkflowId>,
}

impl ConversationContext {
    pub fn with_item(mut self, item_id: &str) -> Self {
        self.last_referenced_item_id = Some(item_id.to_string());
        self
    }

    pub fn with_thread(mut self, thread_id: &str) -> Self {
        self.last_thread_or_group_id = Some(thread_id.to_string());
        self
    }
}
