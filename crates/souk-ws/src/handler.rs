use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use souk_core::events::RegisterError;
use souk_core::{conversation, dispatch, AppState, CoreError};
use souk_models::gateway::*;
use tokio::time::{Duration, Instant};

use crate::session::Session;

const HEARTBEAT_ACK_MSG: &str = r#"{"op":11}"#;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

fn wire_log_in(user_id: Option<i64>, op: u8, payload: &str) {
    tracing::trace!(
        target: "souk::wire",
        direction = "in",
        user_id = ?user_id,
        op,
        bytes = payload.len(),
        "gateway frame"
    );
}

async fn send_text(
    sender: &mut (impl SinkExt<Message> + Unpin),
    payload: String,
) -> Result<(), ()> {
    tracing::trace!(target: "souk::wire", direction = "out", bytes = payload.len(), "gateway frame");
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_op<T: Serialize>(
    sender: &mut (impl SinkExt<Message> + Unpin),
    op: u8,
    payload: &T,
) -> Result<(), ()> {
    let d = serde_json::to_value(payload).map_err(|_| ())?;
    let text = serde_json::to_string(&GatewayMessage::new(op, d)).map_err(|_| ())?;
    send_text(sender, text).await
}

async fn send_dispatch<T: Serialize>(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event_type: &str,
    payload: &T,
) -> Result<(), ()> {
    let d = serde_json::to_value(payload).map_err(|_| ())?;
    let mut msg = GatewayMessage::new(OP_DISPATCH, d);
    msg.t = Some(event_type.to_string());
    let text = serde_json::to_string(&msg).map_err(|_| ())?;
    send_text(sender, text).await
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

fn decode<T: DeserializeOwned>(d: Option<Value>) -> Option<T> {
    serde_json::from_value(d?).ok()
}

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let settings = state.config.gateway;

    let hello = HelloPayload {
        heartbeat_interval: settings.heartbeat_interval_ms,
    };
    if send_op(&mut sender, OP_HELLO, &hello).await.is_err() {
        return;
    }

    let identify_timeout = Duration::from_millis(settings.identify_timeout_ms);
    let user_id = match tokio::time::timeout(
        identify_timeout,
        wait_for_identify(&mut receiver, &state),
    )
    .await
    {
        Ok(Some(user_id)) => user_id,
        outcome => {
            tracing::debug!(timed_out = outcome.is_err(), "gateway identify failed");
            let _ = send_text(
                &mut sender,
                json!({"op": OP_INVALID_SESSION, "d": false}).to_string(),
            )
            .await;
            let _ = send_close(&mut sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            return;
        }
    };

    let handle = match state.event_bus.register(user_id) {
        Ok(handle) => handle,
        Err(err) => {
            let code = match err {
                RegisterError::UserCapacity => CLOSE_POLICY_VIOLATION,
                RegisterError::GlobalCapacity => CLOSE_TRY_AGAIN_LATER,
            };
            tracing::warn!(user_id, "gateway connection refused: {err}");
            let _ = send_close(&mut sender, code, &err.to_string()).await;
            return;
        }
    };
    let mut session = Session::new(handle);

    let ready = ReadyPayload {
        session_id: session.session_id().to_string(),
        user_id,
    };
    if send_dispatch(&mut sender, EVENT_READY, &ready).await.is_err() {
        return;
    }
    tracing::info!(user_id, session_id = %session.session_id(), "gateway session ready");

    run_session(sender, receiver, &mut session, &state).await;
    // Dropping the session unregisters it from every room.
}

/// The first frame must be IDENTIFY with a valid token.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
) -> Option<i64> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let frame: GatewayMessage = serde_json::from_str(text.as_str()).ok()?;
                wire_log_in(None, frame.op, text.as_str());
                if frame.op != OP_IDENTIFY {
                    return None;
                }
                let identify: IdentifyPayload = decode(frame.d)?;
                return souk_core::auth::authenticate(&identify.token, &state.config.jwt_secret)
                    .map_err(|e| tracing::debug!("gateway token rejected: {e}"))
                    .ok();
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
    None
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    session: &mut Session,
    state: &AppState,
) {
    let settings = state.config.gateway;
    let heartbeat_timeout = Duration::from_millis(settings.heartbeat_timeout_ms);
    let mut ping_interval =
        tokio::time::interval(Duration::from_millis(settings.ping_interval_ms.max(1)));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately.
    ping_interval.tick().await;
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);
    let evicted = session.handle.evicted();
    let shutdown = state.shutdown.clone();

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<GatewayMessage>(text.as_str()) else {
                            tracing::debug!(user_id = session.user_id(), "ignoring malformed gateway frame");
                            continue;
                        };
                        wire_log_in(Some(session.user_id()), frame.op, text.as_str());
                        if frame.op == OP_HEARTBEAT {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        }
                        if handle_client_message(frame, &mut sender, session, state).await.is_err() {
                            break "websocket send error".to_string();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame (no code/reason)".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive error: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            }
            frame = session.handle.recv() => {
                let Some(frame) = frame else {
                    break "room hub closed".to_string();
                };
                if send_text(&mut sender, frame.to_string()).await.is_err() {
                    break "websocket send error".to_string();
                }
            }
            () = evicted.cancelled() => {
                let _ = send_close(&mut sender, CLOSE_TRY_AGAIN_LATER, "Outbound queue full").await;
                break "evicted as slow consumer".to_string();
            }
            () = shutdown.cancelled() => {
                let _ = send_close(&mut sender, CLOSE_GOING_AWAY, "Server shutting down").await;
                break "server shutdown".to_string();
            }
            () = &mut heartbeat_sleep => {
                let _ = send_close(&mut sender, CLOSE_POLICY_VIOLATION, "Heartbeat timeout").await;
                break format!("heartbeat timeout after {}ms", settings.heartbeat_timeout_ms);
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
        }
    };

    tracing::info!(
        user_id = session.user_id(),
        session_id = %session.session_id(),
        rooms = session.joined_rooms(),
        "gateway client disconnected: {disconnect_reason}"
    );
}

async fn handle_client_message(
    frame: GatewayMessage,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &AppState,
) -> Result<(), ()> {
    let user_id = session.user_id();
    match frame.op {
        OP_HEARTBEAT => send_text(sender, HEARTBEAT_ACK_MSG.to_string()).await,
        OP_JOIN => {
            let Some(room) = decode::<RoomPayload>(frame.d) else {
                tracing::debug!(user_id, "JOIN without a conversation id");
                let rejected = JoinRejectedPayload {
                    conversation_id: 0,
                    code: ErrorCode::InvalidPayload,
                };
                return send_dispatch(sender, EVENT_JOIN_REJECTED, &rejected).await;
            };
            let conversation_id = room.conversation_id;
            match conversation::ensure_participant(&state.db, conversation_id, user_id).await {
                Ok(_) => {
                    session.join(conversation_id);
                    tracing::debug!(user_id, conversation_id, "room joined");
                    send_dispatch(sender, EVENT_ROOM_JOINED, &room).await
                }
                Err(err) => {
                    log_core_error(user_id, "JOIN", &err);
                    let rejected = JoinRejectedPayload {
                        conversation_id,
                        code: err.code(),
                    };
                    send_dispatch(sender, EVENT_JOIN_REJECTED, &rejected).await
                }
            }
        }
        OP_LEAVE => {
            let Some(room) = decode::<RoomPayload>(frame.d) else {
                let ack = AckPayload::failure(String::new(), ErrorCode::InvalidPayload, "malformed LEAVE");
                return send_op(sender, OP_ACK, &ack).await;
            };
            session.leave(room.conversation_id);
            send_dispatch(sender, EVENT_ROOM_LEFT, &room).await
        }
        OP_SEND => {
            let raw = frame.d.unwrap_or(Value::Null);
            let Ok(payload) = serde_json::from_value::<SendPayload>(raw.clone()) else {
                let nonce = raw
                    .get("nonce")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let ack = AckPayload::failure(nonce, ErrorCode::InvalidPayload, "malformed SEND");
                return send_op(sender, OP_ACK, &ack).await;
            };
            let nonce = Some(payload.nonce.as_str()).filter(|n| !n.is_empty());
            let ack = match dispatch::send_message(
                state,
                payload.conversation_id,
                user_id,
                &payload.content,
                nonce,
            )
            .await
            {
                Ok(message) => AckPayload::success(payload.nonce, message),
                Err(err) => {
                    log_core_error(user_id, "SEND", &err);
                    AckPayload::failure(payload.nonce, err.code(), err.public_message())
                }
            };
            send_op(sender, OP_ACK, &ack).await
        }
        other => {
            tracing::debug!(user_id, op = other, "ignoring unknown gateway op");
            Ok(())
        }
    }
}

fn log_core_error(user_id: i64, op: &str, err: &CoreError) {
    match err {
        CoreError::Database(_) | CoreError::Internal(_) => {
            tracing::error!(user_id, op, "gateway request failed: {err}");
        }
        _ => tracing::debug!(user_id, op, "gateway request rejected: {err}"),
    }
}
