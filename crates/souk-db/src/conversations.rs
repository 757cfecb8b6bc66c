use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub listing_id: i64,
    pub last_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ConversationRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        let last_activity_raw: String = row.try_get("last_activity_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            listing_id: row.try_get("listing_id")?,
            last_message_id: row.try_get("last_message_id")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
            last_activity_at: datetime_from_db_text(&last_activity_raw)?,
        })
    }
}

pub async fn get_conversation(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Option<ConversationRow>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, listing_id, last_message_id, created_at, last_activity_at
         FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_conversation_by_listing(
    pool: &DbPool,
    listing_id: i64,
) -> Result<Option<ConversationRow>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, listing_id, last_message_id, created_at, last_activity_at
         FROM conversations WHERE listing_id = $1",
    )
    .bind(listing_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Create the conversation for `listing_id` with its initial participants.
///
/// Returns `None` when another conversation already holds the listing, in
/// which case nothing is written and the caller should load the winner.
pub async fn create_conversation(
    pool: &DbPool,
    conversation_id: i64,
    listing_id: i64,
    participant_ids: &[i64],
) -> Result<Option<ConversationRow>, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO conversations (id, listing_id, last_message_id, created_at, last_activity_at)
         VALUES ($1, $2, NULL, $3, $3)
         ON CONFLICT (listing_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(listing_id)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    for user_id in participant_ids {
        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(*user_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, listing_id, last_message_id, created_at, last_activity_at
         FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Add participants one row at a time. Existing members are left alone, so
/// concurrent callers can never drop each other's additions.
/// Returns how many users were newly added.
pub async fn add_participants(
    pool: &DbPool,
    conversation_id: i64,
    user_ids: &[i64],
) -> Result<u64, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut added = 0;
    for user_id in user_ids {
        added += sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(*user_id)
        .bind(&now)
        .execute(pool)
        .await?
        .rows_affected();
    }
    Ok(added)
}

pub async fn get_participant_ids(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = $1
         ORDER BY joined_at ASC, user_id ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn is_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<bool, DbError> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = $1 AND user_id = $2 LIMIT 1",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

/// Conversations the user belongs to, most recent activity first.
pub async fn list_user_conversations(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<ConversationRow>, DbError> {
    let rows = sqlx::query_as::<_, ConversationRow>(
        "SELECT c.id, c.listing_id, c.last_message_id, c.created_at, c.last_activity_at
         FROM conversations c
         INNER JOIN conversation_participants p ON p.conversation_id = c.id
         WHERE p.user_id = $1
         ORDER BY c.last_activity_at DESC, c.id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
