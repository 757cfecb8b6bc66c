use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat message as delivered over REST and the gateway.
///
/// Messages are immutable once appended. `id` order is the conversation's
/// log order, so clients can sort and dedupe on it alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "crate::ids")]
    pub id: i64,
    #[serde(with = "crate::ids")]
    pub conversation_id: i64,
    #[serde(with = "crate::ids")]
    pub author_id: i64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}
