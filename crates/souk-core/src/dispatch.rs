use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use souk_models::message::Message;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::{conversation, message, AppState, CoreError};

/// Per-user send quota shared by every connection and the REST path.
#[derive(Clone)]
pub struct SendRateLimiter {
    inner: Arc<DefaultKeyedRateLimiter<i64>>,
}

impl SendRateLimiter {
    pub fn per_minute(sends: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(sends.max(1)).unwrap_or(NonZeroU32::MIN));
        Self {
            inner: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    pub fn check(&self, user_id: i64) -> Result<(), CoreError> {
        self.inner
            .check_key(&user_id)
            .map_err(|_| CoreError::RateLimited)
    }

    /// Drop idle per-user state. Called periodically by the server.
    pub fn prune(&self) {
        self.inner.retain_recent();
        self.inner.shrink_to_fit();
    }
}

/// The single send routine behind both `POST .../messages` and the gateway
/// SEND op: membership, validation, rate limit, append, broadcast. Only
/// sends that would be accepted count against the quota.
///
/// Append and broadcast happen under the conversation's append guard so
/// every room subscriber sees messages in log order. A retry that matches an
/// earlier nonce returns the stored message and is not broadcast again.
pub async fn send_message(
    state: &AppState,
    conversation_id: i64,
    sender_id: i64,
    content: &str,
    nonce: Option<&str>,
) -> Result<Message, CoreError> {
    conversation::ensure_participant(&state.db, conversation_id, sender_id).await?;
    message::validate_send(content, nonce)?;
    state.send_limiter.check(sender_id)?;

    let guard = state.append_locks.acquire(conversation_id).await;
    let outcome = message::append(&state.db, conversation_id, sender_id, content, nonce).await?;
    if outcome.created {
        let delivered = state.event_bus.publish_message_created(&outcome.message)?;
        tracing::debug!(
            conversation_id,
            message_id = outcome.message.id,
            delivered,
            "message broadcast"
        );
    }
    drop(guard);

    if outcome.created {
        state
            .notifier
            .message_created(&state.db, outcome.message.clone());
    }
    Ok(outcome.message)
}
