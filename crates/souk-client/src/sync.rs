use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{ClientError, ConnectionStatus, MessageApi, SharedTimeline};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const PAGE_SIZE: u32 = 500;

/// Polls the REST log while the live channel is not joined to the
/// conversation. Dropping the handle stops the loop.
///
/// The log is also re-fetched once at start and every time the channel
/// (re)joins the room: anything appended while the connection was out of
/// the room was never pushed to it.
pub struct FallbackSync {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FallbackSync {
    pub fn spawn<A>(
        api: A,
        timeline: SharedTimeline,
        status: watch::Receiver<ConnectionStatus>,
        interval: Duration,
    ) -> Self
    where
        A: MessageApi + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(api, timeline, status, interval, cancel.clone()));
        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FallbackSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<A: MessageApi>(
    api: A,
    timeline: SharedTimeline,
    mut status: watch::Receiver<ConnectionStatus>,
    period: Duration,
    cancel: CancellationToken,
) {
    let conversation_id = timeline.lock().await.conversation_id();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Once the realtime task is gone its last status is stale.
    let mut status_closed = false;
    let mut was_joined = status.borrow_and_update().is_joined_to(conversation_id);

    // Initial history load.
    tokio::select! {
        () = cancel.cancelled() => return,
        () = poll(&api, &timeline, conversation_id) => {}
    }

    loop {
        let joined = !status_closed && status.borrow_and_update().is_joined_to(conversation_id);
        if joined {
            if !was_joined {
                was_joined = true;
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = poll(&api, &timeline, conversation_id) => {}
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = status.changed() => {
                    if changed.is_err() {
                        status_closed = true;
                    }
                    ticker.reset();
                    continue;
                }
            }
        }
        was_joined = false;

        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            changed = status.changed(), if !status_closed => {
                if changed.is_err() {
                    status_closed = true;
                }
                continue;
            }
        }

        poll(&api, &timeline, conversation_id).await;
    }
}

async fn poll<A: MessageApi>(api: &A, timeline: &SharedTimeline, conversation_id: i64) {
    match refetch(api, timeline, conversation_id).await {
        Ok(0) => {}
        Ok(inserted) => tracing::debug!(conversation_id, inserted, "fallback poll merged messages"),
        Err(err) => tracing::warn!(conversation_id, "fallback poll failed: {err}"),
    }
}

/// Fetch the whole log page by page and merge it. Returns how many messages
/// were new to the timeline.
pub async fn refetch<A: MessageApi>(
    api: &A,
    timeline: &SharedTimeline,
    conversation_id: i64,
) -> Result<usize, ClientError> {
    let mut after = None;
    let mut fetched = Vec::new();
    loop {
        let page = api.list_since(conversation_id, after, PAGE_SIZE).await?;
        let full = page.len() == PAGE_SIZE as usize;
        after = page.last().map(|m| m.id).or(after);
        fetched.extend(page);
        if !full {
            break;
        }
    }
    Ok(timeline.lock().await.merge(fetched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageTimeline;
    use chrono::Utc;
    use souk_models::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const CONVERSATION: i64 = 7;
    const PERIOD: Duration = Duration::from_secs(15);

    fn msg(id: i64, content: &str) -> Message {
        Message {
            id,
            conversation_id: CONVERSATION,
            author_id: 1,
            content: content.to_string(),
            nonce: None,
            created_at: Utc::now(),
        }
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        log: Arc<Mutex<Vec<Message>>>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeApi {
        fn with(messages: Vec<Message>) -> Self {
            let api = Self::default();
            *api.log.lock().unwrap() = messages;
            api
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MessageApi for FakeApi {
        async fn list_since(
            &self,
            _conversation_id: i64,
            after: Option<i64>,
            limit: u32,
        ) -> Result<Vec<Message>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let log = self.log.lock().unwrap();
            Ok(log
                .iter()
                .filter(|m| m.id > after.unwrap_or(0))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn post_message(
            &self,
            _conversation_id: i64,
            content: &str,
            _nonce: &str,
        ) -> Result<Message, ClientError> {
            let mut log = self.log.lock().unwrap();
            let message = msg(log.len() as i64 + 1, content);
            log.push(message.clone());
            Ok(message)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_and_push_show_message_once() {
        let api = FakeApi::with(vec![msg(1, "hi")]);
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Reconnecting);

        // The live push lands first.
        timeline.lock().await.insert(msg(1, "hi"));
        let sync = FallbackSync::spawn(api.clone(), timeline.clone(), status_rx, PERIOD);
        tokio::time::sleep(PERIOD * 2).await;

        assert!(api.calls() >= 2);
        let contents: Vec<String> = timeline.lock().await.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["hi"]);
        drop(sync);
        drop(status_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_while_joined() {
        let api = FakeApi::with(vec![msg(1, "hi")]);
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Joined(CONVERSATION));

        let _sync = FallbackSync::spawn(api.clone(), timeline.clone(), status_rx, PERIOD);
        tokio::time::sleep(PERIOD * 3).await;
        // Only the initial history load.
        assert_eq!(api.calls(), 1);

        status_tx.send_replace(ConnectionStatus::Reconnecting);
        tokio::time::sleep(PERIOD * 2).await;
        assert!(api.calls() >= 2);
        assert_eq!(timeline.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_at_spawn_still_loads_history() {
        let api = FakeApi::with(vec![msg(1, "hi"), msg(2, "still for sale?")]);
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Joined(CONVERSATION));

        let _sync = FallbackSync::spawn(api.clone(), timeline.clone(), status_rx, PERIOD);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(timeline.lock().await.ids(), vec![1, 2]);

        tokio::time::sleep(PERIOD * 4).await;
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_fetches_messages_missed_while_out_of_the_room() {
        let api = FakeApi::with(vec![msg(1, "hi")]);
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Reconnecting);

        let _sync = FallbackSync::spawn(api.clone(), timeline.clone(), status_rx, PERIOD);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(timeline.lock().await.ids(), vec![1]);

        // Appended between polls, before the room is rejoined: never pushed.
        api.log.lock().unwrap().push(msg(2, "offer: 40"));
        status_tx.send_replace(ConnectionStatus::Joined(CONVERSATION));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(timeline.lock().await.ids(), vec![1, 2]);
        assert_eq!(api.calls(), 2);

        tokio::time::sleep(PERIOD * 10).await;
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_to_another_room_still_polls() {
        let api = FakeApi::with(vec![msg(1, "hi")]);
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Joined(CONVERSATION + 1));

        let _sync = FallbackSync::spawn(api.clone(), timeline.clone(), status_rx, PERIOD);
        tokio::time::sleep(PERIOD).await;
        assert_eq!(timeline.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_polling() {
        let api = FakeApi::default();
        let timeline = MessageTimeline::shared(CONVERSATION);
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let sync = FallbackSync::spawn(api.clone(), timeline, status_rx, PERIOD);
        tokio::time::sleep(PERIOD).await;
        drop(sync);
        tokio::task::yield_now().await;
        let calls = api.calls();
        tokio::time::sleep(PERIOD * 4).await;
        assert_eq!(api.calls(), calls);
    }

    #[tokio::test]
    async fn refetch_walks_every_page() {
        let messages: Vec<Message> = (1..=1_200).map(|i| msg(i, "m")).collect();
        let api = FakeApi::with(messages);
        let timeline = MessageTimeline::shared(CONVERSATION);

        let inserted = refetch(&api, &timeline, CONVERSATION).await.unwrap();
        assert_eq!(inserted, 1_200);
        assert_eq!(api.calls(), 3);
        assert_eq!(refetch(&api, &timeline, CONVERSATION).await.unwrap(), 0);
    }
}
