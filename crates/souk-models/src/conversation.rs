use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Denormalized listing summary shown next to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPreview {
    #[serde(with = "crate::ids")]
    pub listing_id: i64,
    #[serde(with = "crate::ids")]
    pub seller_id: i64,
    pub title: String,
    pub price_cents: i64,
    #[serde(default)]
    pub first_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(with = "crate::ids")]
    pub id: i64,
    #[serde(with = "crate::ids")]
    pub listing_id: i64,
    #[serde(with = "crate::ids::vec")]
    pub participant_ids: Vec<i64>,
    /// Preview cache only; the message log is the source of truth.
    #[serde(with = "crate::ids::option", default)]
    pub last_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub listing: ListingPreview,
    #[serde(default)]
    pub unread_count: i64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: i64) -> bool {
        self.participant_ids.contains(&user_id)
    }
}

/// A user's read marker within one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadState {
    #[serde(with = "crate::ids")]
    pub conversation_id: i64,
    #[serde(with = "crate::ids")]
    pub last_message_id: i64,
}
