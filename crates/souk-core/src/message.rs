use souk_db::messages::MessageRow;
use souk_db::DbPool;
use souk_models::message::Message;
use souk_util::validation::{validate_message_content, validate_nonce};

use crate::CoreError;

pub struct AppendOutcome {
    pub message: Message,
    /// False when a retry matched an earlier send by nonce.
    pub created: bool,
}

pub(crate) fn message_from_row(row: MessageRow) -> Message {
    Message {
        id: row.id,
        conversation_id: row.conversation_id,
        author_id: row.author_id,
        content: row.content,
        nonce: row.nonce,
        created_at: row.created_at,
    }
}

/// Validate a send before anything is written.
pub fn validate_send(content: &str, nonce: Option<&str>) -> Result<(), CoreError> {
    validate_message_content(content)?;
    if let Some(nonce) = nonce {
        validate_nonce(nonce)?;
    }
    Ok(())
}

/// Append to the conversation's log. Membership is not checked here.
///
/// The caller must hold the conversation's append guard; ids come from the
/// process-wide monotonic generator, so log order equals id order.
pub async fn append(
    pool: &DbPool,
    conversation_id: i64,
    author_id: i64,
    content: &str,
    nonce: Option<&str>,
) -> Result<AppendOutcome, CoreError> {
    validate_send(content, nonce)?;

    if let Some(nonce) = nonce {
        if let Some(existing) =
            souk_db::messages::find_by_nonce(pool, conversation_id, author_id, nonce).await?
        {
            tracing::debug!(
                conversation_id,
                message_id = existing.id,
                "duplicate send matched by nonce"
            );
            return Ok(AppendOutcome {
                message: message_from_row(existing),
                created: false,
            });
        }
    }

    let id = souk_util::snowflake::generate(crate::WORKER_ID);
    let row = souk_db::messages::create_message(pool, id, conversation_id, author_id, content, nonce)
        .await
        .map_err(|e| match e {
            souk_db::DbError::NotFound => CoreError::NotFound,
            other => CoreError::Database(other),
        })?;
    Ok(AppendOutcome {
        message: message_from_row(row),
        created: true,
    })
}

/// Messages after `after` (exclusive), ascending by id.
pub async fn list_since(
    pool: &DbPool,
    conversation_id: i64,
    after: Option<i64>,
    limit: u32,
) -> Result<Vec<Message>, CoreError> {
    let rows =
        souk_db::messages::get_messages_after(pool, conversation_id, after, i64::from(limit))
            .await?;
    Ok(rows.into_iter().map(message_from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    async fn conversation(state: &crate::AppState) -> i64 {
        crate::conversation::start_or_get_conversation(
            &state.db,
            &state.listings,
            LISTING,
            BUYER_ONE,
            None,
        )
        .await
        .unwrap()
        .conversation
        .id
    }

    #[tokio::test]
    async fn blank_text_is_rejected_before_writing() {
        let state = state().await;
        let id = conversation(&state).await;

        for text in ["", "   ", "\n\t"] {
            let err = append(&state.db, id, BUYER_ONE, text, None).await.err().unwrap();
            assert!(matches!(err, CoreError::InvalidPayload(_)));
        }
        assert_eq!(souk_db::messages::count_messages(&state.db, id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ids_follow_append_order() {
        let state = state().await;
        let id = conversation(&state).await;

        let mut appended = Vec::new();
        for i in 0..5 {
            let out = append(&state.db, id, SELLER, &format!("m{i}"), None)
                .await
                .unwrap();
            appended.push(out.message.id);
        }
        let listed: Vec<i64> = list_since(&state.db, id, None, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, appended);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));

        let tail = list_since(&state.db, id, Some(appended[2]), 100).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn retried_nonce_returns_original() {
        let state = state().await;
        let id = conversation(&state).await;

        let first = append(&state.db, id, BUYER_ONE, "hi", Some("n-1")).await.unwrap();
        let retry = append(&state.db, id, BUYER_ONE, "hi", Some("n-1")).await.unwrap();
        assert!(first.created);
        assert!(!retry.created);
        assert_eq!(first.message, retry.message);
        assert_eq!(souk_db::messages::count_messages(&state.db, id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_is_not_found() {
        let state = state().await;
        let err = append(&state.db, 123_456, BUYER_ONE, "hi", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::NotFound | CoreError::Database(_)));
    }
}
