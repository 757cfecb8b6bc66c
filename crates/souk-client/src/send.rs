use std::future::Future;

use souk_models::message::Message;

use crate::sync::refetch;
use crate::{ClientError, ConnectionStatus, MessageApi, RealtimeClient, SharedTimeline};

/// The live half of the send path.
pub trait LiveChannel: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    fn send(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send;
}

impl LiveChannel for RealtimeClient {
    fn status(&self) -> ConnectionStatus {
        RealtimeClient::status(self)
    }

    async fn send(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ClientError> {
        RealtimeClient::send(self, conversation_id, content, nonce).await
    }
}

/// Routes a send over the live channel when it is joined to the
/// conversation, over REST otherwise.
///
/// A failed live send is never retried over REST. When the failure leaves
/// the outcome unknown (no ACK, connection closed) the log is checked for
/// the nonce first, and only a send missing from the log is reported as
/// failed. Retrying with the same nonce through
/// [`SendPath::send_with_nonce`] is deduplicated by the server.
pub struct SendPath<L, A> {
    live: L,
    api: A,
    timeline: SharedTimeline,
}

impl<L: LiveChannel, A: MessageApi> SendPath<L, A> {
    pub fn new(live: L, api: A, timeline: SharedTimeline) -> Self {
        Self { live, api, timeline }
    }

    pub fn live(&self) -> &L {
        &self.live
    }

    pub async fn send(&self, conversation_id: i64, text: &str) -> Result<Message, ClientError> {
        let nonce = new_nonce();
        self.send_with_nonce(conversation_id, text, &nonce).await
    }

    pub async fn send_with_nonce(
        &self,
        conversation_id: i64,
        text: &str,
        nonce: &str,
    ) -> Result<Message, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let message = if self.live.status().is_joined_to(conversation_id) {
            tracing::debug!(conversation_id, "sending over realtime");
            match self.live.send(conversation_id, text, nonce).await {
                Ok(message) => message,
                Err(err) if err.is_ambiguous() => {
                    self.find_in_log(conversation_id, nonce, err).await?
                }
                Err(err) => return Err(err),
            }
        } else {
            tracing::debug!(conversation_id, "sending over rest");
            self.api.post_message(conversation_id, text, nonce).await?
        };
        self.timeline.lock().await.insert(message.clone());
        Ok(message)
    }

    async fn find_in_log(
        &self,
        conversation_id: i64,
        nonce: &str,
        err: ClientError,
    ) -> Result<Message, ClientError> {
        tracing::debug!(conversation_id, "live send unconfirmed, checking the log: {err}");
        if let Err(fetch_err) = refetch(&self.api, &self.timeline, conversation_id).await {
            tracing::warn!(conversation_id, "could not check the log: {fetch_err}");
            return Err(err);
        }
        match self.timeline.lock().await.find_by_nonce(nonce) {
            Some(message) => Ok(message.clone()),
            None => Err(err),
        }
    }

    /// Send the composer's draft, putting it back if the send fails.
    pub async fn submit(
        &self,
        composer: &mut Composer,
        conversation_id: i64,
    ) -> Result<Option<Message>, ClientError> {
        let Some((text, nonce)) = composer.take_for_send() else {
            return Ok(None);
        };
        match self.send_with_nonce(conversation_id, &text, &nonce).await {
            Ok(message) => {
                composer.confirm_sent();
                Ok(Some(message))
            }
            Err(err) => {
                composer.restore_on_failure();
                Err(err)
            }
        }
    }
}

fn new_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
struct Outgoing {
    text: String,
    nonce: String,
}

/// Input box state with optimistic clearing.
///
/// A failed send keeps its nonce: resending the same text reuses it, so a
/// send that did reach the server is not appended twice.
#[derive(Debug, Default)]
pub struct Composer {
    draft: String,
    in_flight: Option<Outgoing>,
    failed: Option<Outgoing>,
}

impl Composer {
    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Clear the input and hand back the text with its nonce. Blank drafts
    /// are left alone.
    pub fn take_for_send(&mut self) -> Option<(String, String)> {
        if self.draft.trim().is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.draft);
        let nonce = match self.failed.take() {
            Some(failed) if failed.text == text => failed.nonce,
            _ => new_nonce(),
        };
        self.in_flight = Some(Outgoing {
            text: text.clone(),
            nonce: nonce.clone(),
        });
        Some((text, nonce))
    }

    /// Put the unsent text back. Anything typed meanwhile is kept after it.
    pub fn restore_on_failure(&mut self) {
        let Some(outgoing) = self.in_flight.take() else {
            return;
        };
        self.draft = if self.draft.trim().is_empty() {
            outgoing.text.clone()
        } else {
            format!("{}\n{}", outgoing.text, self.draft)
        };
        self.failed = Some(outgoing);
    }

    pub fn confirm_sent(&mut self) {
        self.in_flight = None;
        self.failed = None;
    }
}
