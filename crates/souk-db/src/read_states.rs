use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::Utc;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadStateRow {
    pub user_id: i64,
    pub conversation_id: i64,
    pub last_message_id: i64,
}

pub async fn get_read_state(
    pool: &DbPool,
    user_id: i64,
    conversation_id: i64,
) -> Result<Option<ReadStateRow>, DbError> {
    let row = sqlx::query_as::<_, ReadStateRow>(
        "SELECT user_id, conversation_id, last_message_id
         FROM read_states WHERE user_id = $1 AND conversation_id = $2",
    )
    .bind(user_id)
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Move the read marker forward. A stale marker never rewinds it.
pub async fn update_read_state(
    pool: &DbPool,
    user_id: i64,
    conversation_id: i64,
    last_message_id: i64,
) -> Result<ReadStateRow, DbError> {
    let row = sqlx::query_as::<_, ReadStateRow>(
        "INSERT INTO read_states (user_id, conversation_id, last_message_id, updated_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, conversation_id) DO UPDATE SET
             last_message_id = CASE
                 WHEN excluded.last_message_id > read_states.last_message_id
                 THEN excluded.last_message_id
                 ELSE read_states.last_message_id
             END,
             updated_at = excluded.updated_at
         RETURNING user_id, conversation_id, last_message_id",
    )
    .bind(user_id)
    .bind(conversation_id)
    .bind(last_message_id)
    .bind(datetime_to_db_text(Utc::now()))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Per-conversation count of messages from other participants newer than
/// the user's read marker.
pub async fn unread_counts(pool: &DbPool, user_id: i64) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT p.conversation_id, COUNT(m.id) AS unread
         FROM conversation_participants p
         LEFT JOIN read_states r
             ON r.user_id = p.user_id AND r.conversation_id = p.conversation_id
         LEFT JOIN messages m
             ON m.conversation_id = p.conversation_id
            AND m.author_id <> p.user_id
            AND m.id > COALESCE(r.last_message_id, 0)
         WHERE p.user_id = $1
         GROUP BY p.conversation_id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
