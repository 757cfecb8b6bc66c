use serde::Serialize;
use souk_db::DbPool;
use souk_models::message::Message;
use std::time::Duration;

/// Out-of-band notification of new messages (push, email digests). Delivery
/// is best effort and never affects the send result.
#[derive(Clone)]
pub enum NotificationSink {
    Log,
    Webhook(WebhookNotifier),
}

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct MessageNotification<'a> {
    event: &'static str,
    #[serde(with = "souk_models::ids::vec")]
    recipient_ids: Vec<i64>,
    message: &'a Message,
}

impl NotificationSink {
    /// Notify every participant except the author. Runs on its own task.
    pub fn message_created(&self, db: &DbPool, message: Message) {
        let sink = self.clone();
        let db = db.clone();
        tokio::spawn(async move {
            let recipients = match souk_db::conversations::get_participant_ids(
                &db,
                message.conversation_id,
            )
            .await
            {
                Ok(ids) => ids
                    .into_iter()
                    .filter(|id| *id != message.author_id)
                    .collect::<Vec<_>>(),
                Err(e) => {
                    tracing::warn!(
                        conversation_id = message.conversation_id,
                        "notification skipped, participants unavailable: {e}"
                    );
                    return;
                }
            };
            sink.deliver(recipients, &message).await;
        });
    }

    async fn deliver(&self, recipient_ids: Vec<i64>, message: &Message) {
        if recipient_ids.is_empty() {
            return;
        }
        match self {
            NotificationSink::Log => {
                tracing::info!(
                    conversation_id = message.conversation_id,
                    message_id = message.id,
                    recipients = recipient_ids.len(),
                    "message notification"
                );
            }
            NotificationSink::Webhook(hook) => {
                let body = MessageNotification {
                    event: "message.created",
                    recipient_ids,
                    message,
                };
                match hook.client.post(&hook.url).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        tracing::warn!(status = %resp.status(), "notification webhook rejected");
                    }
                    Err(e) => tracing::warn!("notification webhook failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn webhook_receives_recipients_without_author() -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let state = crate::testing::state().await;
        souk_db::conversations::create_conversation(&state.db, 500, 70, &[1, 2, 3]).await?;
        let sink = NotificationSink::Webhook(WebhookNotifier::new(&format!("http://{addr}/hook"))?);
        let message = Message {
            id: 900,
            conversation_id: 500,
            author_id: 2,
            content: "hello".into(),
            nonce: None,
            created_at: chrono::Utc::now(),
        };
        sink.message_created(&state.db, message);

        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .expect("webhook body");
        assert_eq!(body["event"], "message.created");
        assert_eq!(body["recipient_ids"], serde_json::json!(["1", "3"]));
        assert_eq!(body["message"]["id"], "900");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() -> anyhow::Result<()> {
        let sink = NotificationSink::Webhook(WebhookNotifier::new("http://127.0.0.1:9/hook")?);
        let message = Message {
            id: 1,
            conversation_id: 1,
            author_id: 1,
            content: "x".into(),
            nonce: None,
            created_at: chrono::Utc::now(),
        };
        sink.deliver(vec![2], &message).await;
        Ok(())
    }
}
