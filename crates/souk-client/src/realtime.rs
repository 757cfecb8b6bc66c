use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use souk_models::gateway::*;
use souk_models::message::Message;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{ClientError, SharedTimeline};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Health of the live channel as seen by the fallback loop and the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Identified, no room joined yet.
    Connected,
    /// Subscribed to this conversation's room.
    Joined(i64),
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_joined_to(&self, conversation_id: i64) -> bool {
        *self == ConnectionStatus::Joined(conversation_id)
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// `ws://host:port/gateway`
    pub url: String,
    pub token: String,
    pub ack_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ack_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

enum Command {
    Join(i64),
    Leave,
    Send {
        payload: SendPayload,
        reply: oneshot::Sender<AckPayload>,
    },
}

enum Exit {
    /// Connection lost; try again after backoff.
    Lost(String),
    /// The owner went away or asked to stop.
    Stop,
}

/// One live gateway session for one open conversation, reconnecting in the
/// background. Dropping it stops the task.
pub struct RealtimeClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    ack_timeout: Duration,
    _stop: DropGuard,
}

impl RealtimeClient {
    /// Start connecting. `MESSAGE_CREATE` events for the joined conversation
    /// are merged into `timeline`.
    pub fn start(config: RealtimeConfig, timeline: SharedTimeline) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let cancel = CancellationToken::new();
        let ack_timeout = config.ack_timeout;

        tokio::spawn(supervise(
            config,
            commands_rx,
            status_tx,
            timeline,
            cancel.clone(),
        ));

        Self {
            commands: commands_tx,
            status: status_rx,
            ack_timeout,
            _stop: cancel.drop_guard(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Subscribe to a conversation's room, leaving any previous one. The
    /// room is rejoined automatically after a reconnect.
    pub async fn join(&self, conversation_id: i64) -> Result<(), ClientError> {
        self.commands
            .send(Command::Join(conversation_id))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn leave(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Leave)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// SEND over the live channel and wait for its ACK.
    pub async fn send(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ClientError> {
        let (reply, ack) = oneshot::channel();
        let payload = SendPayload {
            conversation_id,
            content: content.to_string(),
            nonce: nonce.to_string(),
        };
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| ClientError::Closed)?;

        let ack = tokio::time::timeout(self.ack_timeout, ack)
            .await
            .map_err(|_| ClientError::AckTimeout(self.ack_timeout))?
            .map_err(|_| ClientError::Closed)?;
        match (ack.ok, ack.message, ack.error) {
            (true, Some(message), _) => Ok(message),
            (_, _, Some(error)) => Err(ClientError::Rejected {
                code: error.code,
                message: error.message,
            }),
            _ => Err(ClientError::Protocol("ACK without message or error".into())),
        }
    }
}

async fn supervise(
    config: RealtimeConfig,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    timeline: SharedTimeline,
    cancel: CancellationToken,
) {
    let mut room: Option<i64> = None;
    let mut backoff = config.reconnect_min;

    loop {
        let attempt = tokio::select! {
            () = cancel.cancelled() => break,
            attempt = connect_and_identify(&config) => attempt,
        };
        match attempt {
            Ok((socket, heartbeat)) => {
                backoff = config.reconnect_min;
                status.send_replace(ConnectionStatus::Connected);
                tracing::debug!(url = %config.url, "realtime connected");
                let mut connection = Connection {
                    socket,
                    status: &status,
                    timeline: &timeline,
                    pending: HashMap::new(),
                };
                match connection
                    .run(&mut commands, &mut room, heartbeat, &cancel)
                    .await
                {
                    Exit::Stop => break,
                    Exit::Lost(reason) => tracing::info!("realtime connection lost: {reason}"),
                }
            }
            Err(ClientError::InvalidSession) => {
                tracing::warn!("realtime token rejected, falling back to polling");
                break;
            }
            Err(err) => tracing::debug!("realtime connect failed: {err}"),
        }

        status.send_replace(ConnectionStatus::Reconnecting);
        let wait = tokio::time::sleep(backoff);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    status.send_replace(ConnectionStatus::Disconnected);
                    return;
                }
                () = &mut wait => break,
                command = commands.recv() => match command {
                    // Sends fail fast while offline: the reply is dropped.
                    Some(Command::Send { .. }) => {}
                    Some(Command::Join(conversation_id)) => room = Some(conversation_id),
                    Some(Command::Leave) => room = None,
                    None => {
                        status.send_replace(ConnectionStatus::Disconnected);
                        return;
                    }
                },
            }
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
    status.send_replace(ConnectionStatus::Disconnected);
}

/// HELLO, IDENTIFY, READY. Returns the socket and the heartbeat interval.
async fn connect_and_identify(config: &RealtimeConfig) -> Result<(Socket, Duration), ClientError> {
    let (mut socket, _) = connect_async(config.url.as_str()).await?;

    let hello = next_frame(&mut socket).await?;
    if hello.op != OP_HELLO {
        return Err(ClientError::Protocol(format!("expected HELLO, got op {}", hello.op)));
    }
    let hello: HelloPayload = serde_json::from_value(hello.d.unwrap_or(Value::Null))?;

    let identify = IdentifyPayload {
        token: config.token.clone(),
    };
    send_op(&mut socket, OP_IDENTIFY, &identify).await?;

    let ready = next_frame(&mut socket).await?;
    match ready.op {
        OP_DISPATCH if ready.t.as_deref() == Some(EVENT_READY) => {}
        OP_INVALID_SESSION => return Err(ClientError::InvalidSession),
        op => return Err(ClientError::Protocol(format!("expected READY, got op {op}"))),
    }
    Ok((socket, Duration::from_millis(hello.heartbeat_interval.max(1))))
}

async fn next_frame(socket: &mut Socket) -> Result<GatewayMessage, ClientError> {
    loop {
        match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(ClientError::Protocol(format!("closed during handshake: {frame:?}")))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
            None => return Err(ClientError::Closed),
        }
    }
}

async fn send_op<T: Serialize>(socket: &mut Socket, op: u8, payload: &T) -> Result<(), ClientError> {
    let frame = GatewayMessage::new(op, serde_json::to_value(payload)?);
    socket
        .send(WsMessage::text(serde_json::to_string(&frame)?))
        .await?;
    Ok(())
}

type PendingAcks = HashMap<String, oneshot::Sender<AckPayload>>;

/// Forget SENDs whose caller stopped waiting, e.g. after an ACK timeout.
fn prune_abandoned(pending: &mut PendingAcks) -> usize {
    let before = pending.len();
    pending.retain(|_, waiter| !waiter.is_closed());
    before - pending.len()
}

struct Connection<'a> {
    socket: Socket,
    status: &'a watch::Sender<ConnectionStatus>,
    timeline: &'a SharedTimeline,
    /// SENDs awaiting their ACK, keyed by nonce. Dropped with the
    /// connection, which fails the waiters.
    pending: PendingAcks,
}

impl Connection<'_> {
    async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        room: &mut Option<i64>,
        heartbeat: Duration,
        cancel: &CancellationToken,
    ) -> Exit {
        if let Some(conversation_id) = *room {
            if let Err(err) = self.room_op(OP_JOIN, conversation_id).await {
                return Exit::Lost(err.to_string());
            }
        }

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = self.socket.close(None).await;
                    return Exit::Stop;
                }
                _ = ticker.tick() => {
                    let abandoned = prune_abandoned(&mut self.pending);
                    if abandoned > 0 {
                        tracing::debug!(abandoned, "dropped SENDs whose caller gave up");
                    }
                    let beat = json!({ "op": OP_HEARTBEAT }).to_string();
                    if let Err(err) = self.socket.send(WsMessage::text(beat)).await {
                        return Exit::Lost(err.to_string());
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = self.socket.close(None).await;
                        return Exit::Stop;
                    };
                    if let Err(err) = self.handle_command(command, room).await {
                        return Exit::Lost(err.to_string());
                    }
                }
                incoming = self.socket.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<GatewayMessage>(text.as_str()) {
                            Ok(frame) => self.handle_frame(frame, room).await,
                            Err(err) => tracing::debug!("ignoring malformed frame: {err}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Exit::Lost(format!("server closed: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Exit::Lost(err.to_string()),
                    None => return Exit::Lost("stream ended".into()),
                },
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        room: &mut Option<i64>,
    ) -> Result<(), ClientError> {
        match command {
            Command::Join(conversation_id) => {
                if let Some(previous) = room.replace(conversation_id) {
                    if previous != conversation_id {
                        self.status.send_replace(ConnectionStatus::Connected);
                        self.room_op(OP_LEAVE, previous).await?;
                    }
                }
                self.room_op(OP_JOIN, conversation_id).await
            }
            Command::Leave => {
                if let Some(previous) = room.take() {
                    self.status.send_replace(ConnectionStatus::Connected);
                    self.room_op(OP_LEAVE, previous).await?;
                }
                Ok(())
            }
            Command::Send { payload, reply } => {
                let nonce = payload.nonce.clone();
                send_op(&mut self.socket, OP_SEND, &payload).await?;
                self.pending.insert(nonce, reply);
                Ok(())
            }
        }
    }

    async fn room_op(&mut self, op: u8, conversation_id: i64) -> Result<(), ClientError> {
        send_op(&mut self.socket, op, &RoomPayload { conversation_id }).await
    }

    async fn handle_frame(&mut self, frame: GatewayMessage, room: &mut Option<i64>) {
        match frame.op {
            OP_ACK => {
                let Some(ack) = frame
                    .d
                    .and_then(|d| serde_json::from_value::<AckPayload>(d).ok())
                else {
                    return;
                };
                if let Some(waiter) = self.pending.remove(&ack.nonce) {
                    let _ = waiter.send(ack);
                }
            }
            OP_DISPATCH => {
                let d = frame.d.unwrap_or(Value::Null);
                match frame.t.as_deref() {
                    Some(EVENT_MESSAGE_CREATE) => match serde_json::from_value::<Message>(d) {
                        Ok(message) if Some(message.conversation_id) == *room => {
                            self.timeline.lock().await.insert(message);
                        }
                        Ok(_) => {}
                        Err(err) => tracing::debug!("bad MESSAGE_CREATE: {err}"),
                    },
                    Some(EVENT_ROOM_JOINED) => {
                        if let Ok(joined) = serde_json::from_value::<RoomPayload>(d) {
                            if Some(joined.conversation_id) == *room {
                                self.status
                                    .send_replace(ConnectionStatus::Joined(joined.conversation_id));
                            }
                        }
                    }
                    Some(EVENT_JOIN_REJECTED) => {
                        if let Ok(rejected) = serde_json::from_value::<JoinRejectedPayload>(d) {
                            tracing::warn!(
                                conversation_id = rejected.conversation_id,
                                code = ?rejected.code,
                                "room join rejected"
                            );
                            if Some(rejected.conversation_id) == *room {
                                *room = None;
                                self.status.send_replace(ConnectionStatus::Connected);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
