use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub author_id: i64,
    pub content: String,
    pub nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            author_id: row.try_get("author_id")?,
            content: row.try_get("content")?,
            nonce: row.try_get("nonce")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

/// Append a message and advance the conversation's preview pointer in one
/// transaction. Callers must hold the conversation's append lock so that id
/// order and commit order agree.
pub async fn create_message(
    pool: &DbPool,
    id: i64,
    conversation_id: i64,
    author_id: i64,
    content: &str,
    nonce: Option<&str>,
) -> Result<MessageRow, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (id, conversation_id, author_id, content, nonce, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, conversation_id, author_id, content, nonce, created_at",
    )
    .bind(id)
    .bind(conversation_id)
    .bind(author_id)
    .bind(content)
    .bind(nonce)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await?;

    let touched = sqlx::query(
        "UPDATE conversations SET last_message_id = $1, last_activity_at = $2 WHERE id = $3",
    )
    .bind(id)
    .bind(&now)
    .bind(conversation_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if touched == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    tx.commit().await?;
    Ok(row)
}

pub async fn find_by_nonce(
    pool: &DbPool,
    conversation_id: i64,
    author_id: i64,
    nonce: &str,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT id, conversation_id, author_id, content, nonce, created_at
         FROM messages
         WHERE conversation_id = $1 AND author_id = $2 AND nonce = $3",
    )
    .bind(conversation_id)
    .bind(author_id)
    .bind(nonce)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Messages with id strictly greater than `after`, oldest first.
pub async fn get_messages_after(
    pool: &DbPool,
    conversation_id: i64,
    after: Option<i64>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, conversation_id, author_id, content, nonce, created_at
         FROM messages
         WHERE conversation_id = $1 AND id > $2
         ORDER BY id ASC
         LIMIT $3",
    )
    .bind(conversation_id)
    .bind(after.unwrap_or(0))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_messages(pool: &DbPool, conversation_id: i64) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
        .bind(conversation_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
