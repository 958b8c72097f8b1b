//! Single-event push notifications from the source

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "post.created")]
    Created,
    #[serde(rename = "post.updated")]
    Updated,
    #[serde(rename = "post.deleted")]
    Deleted,
}

impl WebhookEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "post.created",
            Self::Updated => "post.updated",
            Self::Deleted => "post.deleted",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub external_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}
