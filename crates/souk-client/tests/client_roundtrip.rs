use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use souk_client::{
    ClientError, Composer, ConnectionStatus, FallbackSync, LiveChannel, MessageApi,
    MessageTimeline, RealtimeClient, RealtimeConfig, RestClient, SendPath, SharedTimeline,
};
use souk_models::message::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use souk_core::listings::ListingProvider;
use souk_core::notify::NotificationSink;
use souk_core::{AppConfig, AppState, GatewaySettings};
use souk_db::listings::{upsert_listing, ListingRow};

const SECRET: &str = "client-test-secret-client-test-secret";
const SELLER: i64 = 1;
const BUYER: i64 = 2;
const LISTING: i64 = 10;

struct Server {
    addr: SocketAddr,
}

impl Server {
    async fn start() -> anyhow::Result<Self> {
        let db = souk_db::create_pool("sqlite::memory:", 1).await?;
        souk_db::run_migrations(&db, souk_db::DatabaseEngine::Sqlite).await?;
        upsert_listing(
            &db,
            &ListingRow {
                id: LISTING,
                seller_id: SELLER,
                title: "Road bike".into(),
                price_cents: 45_000,
                first_image: None,
            },
        )
        .await?;
        let state = AppState::new(
            db.clone(),
            AppConfig {
                jwt_secret: SECRET.to_string(),
                jwt_expiry_seconds: 3600,
                gateway: GatewaySettings::default(),
            },
            ListingProvider::Database(db),
            NotificationSink::Log,
        );
        let app = souk_api::build_router()
            .merge(souk_ws::gateway_router())
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr })
    }

    fn token(user_id: i64) -> anyhow::Result<String> {
        Ok(souk_core::auth::create_token(user_id, SECRET, 3600)?)
    }

    fn rest(&self, user_id: i64) -> anyhow::Result<RestClient> {
        Ok(RestClient::new(format!("http://{}", self.addr), Self::token(user_id)?)?)
    }

    fn realtime(&self, user_id: i64, timeline: SharedTimeline) -> anyhow::Result<RealtimeClient> {
        let config = RealtimeConfig::new(format!("ws://{}/gateway", self.addr), Self::token(user_id)?);
        Ok(RealtimeClient::start(config, timeline))
    }
}

/// TCP relay in front of the server whose open links can be cut.
struct Relay {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Relay {
    async fn start(target: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let links: Arc<Mutex<Vec<AbortHandle>>> = Arc::default();
        let accepted = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accepted.lock().unwrap().push(link.abort_handle());
            }
        });
        Ok(Self { addr, links })
    }

    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

/// Live channel whose SEND reaches the server but whose ACK never arrives.
struct LostAck {
    rest: RestClient,
    conversation_id: i64,
}

impl LiveChannel for LostAck {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Joined(self.conversation_id)
    }

    async fn send(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ClientError> {
        self.rest.post_message(conversation_id, content, nonce).await?;
        Err(ClientError::AckTimeout(Duration::from_secs(10)))
    }
}

async fn wait_joined(client: &RealtimeClient, conversation_id: i64) -> anyhow::Result<()> {
    let mut status = client.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.is_joined_to(conversation_id)),
    )
    .await
    .context("join timed out")??;
    Ok(())
}

async fn wait_for_len(timeline: &SharedTimeline, len: usize) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while timeline.lock().await.len() < len {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("timeline did not fill in time")
}

#[tokio::test]
async fn live_send_reaches_peer_in_log_order() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let buyer_rest = server.rest(BUYER)?;
    let conversation = buyer_rest.start_conversation(LISTING, None).await?;

    let seller_timeline = MessageTimeline::shared(conversation.id);
    let seller_live = server.realtime(SELLER, seller_timeline.clone())?;
    seller_live.join(conversation.id).await?;
    wait_joined(&seller_live, conversation.id).await?;

    let buyer_timeline = MessageTimeline::shared(conversation.id);
    let buyer_live = server.realtime(BUYER, buyer_timeline.clone())?;
    buyer_live.join(conversation.id).await?;
    wait_joined(&buyer_live, conversation.id).await?;

    let path = SendPath::new(buyer_live, buyer_rest.clone(), buyer_timeline.clone());
    for text in ["hello", "is it still available?", "can you ship?"] {
        path.send(conversation.id, text).await?;
    }

    wait_for_len(&seller_timeline, 3).await?;
    let pushed = seller_timeline.lock().await.ids();
    let logged: Vec<i64> = buyer_rest
        .list_since(conversation.id, None, 100)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(pushed, logged);

    // The sender's own push and its ACK land on the same entry.
    wait_for_len(&buyer_timeline, 3).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(buyer_timeline.lock().await.ids(), logged);
    Ok(())
}

#[tokio::test]
async fn rejected_token_falls_back_to_polling() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let buyer_rest = server.rest(BUYER)?;
    let conversation = buyer_rest.start_conversation(LISTING, None).await?;

    let timeline = MessageTimeline::shared(conversation.id);
    let config = RealtimeConfig::new(format!("ws://{}/gateway", server.addr), "not-a-token");
    let live = RealtimeClient::start(config, timeline.clone());
    let mut status = live.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Disconnected),
    )
    .await
    .context("realtime never gave up")??;

    let _sync = FallbackSync::spawn(
        buyer_rest.clone(),
        timeline.clone(),
        live.subscribe_status(),
        Duration::from_millis(50),
    );

    let seller_rest = server.rest(SELLER)?;
    let sent = seller_rest.post_message(conversation.id, "hi", "seller-1").await?;

    wait_for_len(&timeline, 1).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let shown: Vec<String> = timeline.lock().await.iter().map(|m| m.content.clone()).collect();
    assert_eq!(shown, vec!["hi"]);

    // Sending while offline goes over REST.
    let path = SendPath::new(live, buyer_rest, timeline.clone());
    let reply = path.send(conversation.id, "hi back").await?;
    assert!(reply.id > sent.id);
    assert_eq!(timeline.lock().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn outsider_join_is_rejected() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let conversation = server.rest(BUYER)?.start_conversation(LISTING, None).await?;

    let timeline = MessageTimeline::shared(conversation.id);
    let outsider = server.realtime(99, timeline.clone())?;
    let mut status = outsider.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await
    .context("never connected")??;

    outsider.join(conversation.id).await?;
    server
        .rest(SELLER)?
        .post_message(conversation.id, "private", "s-1")
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(outsider.status(), ConnectionStatus::Connected);
    assert!(timeline.lock().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn resent_draft_is_stored_once() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let buyer_rest = server.rest(BUYER)?;
    let conversation = buyer_rest.start_conversation(LISTING, None).await?;

    let mut composer = Composer::default();
    composer.set_draft("would you take 400?");
    let (text, nonce) = composer.take_for_send().context("draft was blank")?;
    // The first attempt lands but the caller never hears back.
    buyer_rest.post_message(conversation.id, &text, &nonce).await?;
    composer.restore_on_failure();

    let (text, retry_nonce) = composer.take_for_send().context("draft was blank")?;
    assert_eq!(retry_nonce, nonce);
    buyer_rest.post_message(conversation.id, &text, &retry_nonce).await?;
    composer.confirm_sent();

    let logged = buyer_rest.list_since(conversation.id, None, 100).await?;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].content, "would you take 400?");
    Ok(())
}

#[tokio::test]
async fn unacknowledged_live_send_is_confirmed_from_the_log() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let buyer_rest = server.rest(BUYER)?;
    let conversation = buyer_rest.start_conversation(LISTING, None).await?;

    let timeline = MessageTimeline::shared(conversation.id);
    let live = LostAck {
        rest: buyer_rest.clone(),
        conversation_id: conversation.id,
    };
    let path = SendPath::new(live, buyer_rest.clone(), timeline.clone());
    let mut composer = Composer::default();
    composer.set_draft("can you ship?");

    let sent = path
        .submit(&mut composer, conversation.id)
        .await?
        .context("nothing was sent")?;
    assert_eq!(sent.content, "can you ship?");
    assert_eq!(composer.draft(), "");
    assert!(!composer.is_sending());

    let logged = buyer_rest.list_since(conversation.id, None, 100).await?;
    assert_eq!(logged.len(), 1);
    assert_eq!(timeline.lock().await.ids(), vec![logged[0].id]);
    Ok(())
}

#[tokio::test]
async fn message_sent_while_reconnecting_appears_after_rejoin() -> anyhow::Result<()> {
    let server = Server::start().await?;
    let buyer_rest = server.rest(BUYER)?;
    let conversation = buyer_rest.start_conversation(LISTING, None).await?;
    let relay = Relay::start(server.addr).await?;

    let timeline = MessageTimeline::shared(conversation.id);
    let mut config = RealtimeConfig::new(format!("ws://{}/gateway", relay.addr), Server::token(BUYER)?);
    config.reconnect_min = Duration::from_millis(50);
    config.reconnect_max = Duration::from_millis(200);
    let live = RealtimeClient::start(config, timeline.clone());
    live.join(conversation.id).await?;
    wait_joined(&live, conversation.id).await?;

    // Polling alone would not pick anything up within the test.
    let _sync = FallbackSync::spawn(
        buyer_rest.clone(),
        timeline.clone(),
        live.subscribe_status(),
        Duration::from_secs(3600),
    );

    relay.cut();
    let mut status = live.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| !s.is_joined_to(conversation.id)),
    )
    .await
    .context("connection never dropped")??;

    server
        .rest(SELLER)?
        .post_message(conversation.id, "price drop: 400", "s-1")
        .await?;

    wait_joined(&live, conversation.id).await?;
    wait_for_len(&timeline, 1).await?;
    let shown: Vec<String> = timeline.lock().await.iter().map(|m| m.content.clone()).collect();
    assert_eq!(shown, vec!["price drop: 400"]);
    Ok(())
}
