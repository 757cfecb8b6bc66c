//! Room hub for the realtime gateway.
//!
//! Each authenticated connection registers a session and gets a bounded
//! queue of pre-serialized frames. Rooms map a conversation id to the
//! sessions that joined it. Publishing never waits: a session whose queue
//! is full is evicted and its eviction token cancelled so the connection
//! task can close the socket.

use dashmap::DashMap;
use souk_models::gateway::{GatewayMessage, EVENT_MESSAGE_CREATE, OP_DISPATCH};
use souk_models::message::Message;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::CoreError;

/// A frame ready to be written to every subscriber as-is.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy)]
pub struct HubLimits {
    pub max_sessions_per_user: usize,
    pub max_sessions_total: usize,
    pub queue_capacity: usize,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            max_sessions_total: 2_000,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("server is at connection capacity")]
    GlobalCapacity,
    #[error("too many connections for this user")]
    UserCapacity,
}

struct SessionEntry {
    user_id: i64,
    sender: mpsc::Sender<Frame>,
    evicted: CancellationToken,
    rooms: HashSet<i64>,
}

struct Hub {
    limits: HubLimits,
    sessions: DashMap<String, SessionEntry>,
    rooms: DashMap<i64, HashSet<String>>,
    user_sessions: DashMap<i64, usize>,
    total: AtomicUsize,
}

// Lock order: a `sessions` entry may be held while touching `rooms`, never
// the other way round.
#[derive(Clone)]
pub struct EventBus {
    hub: Arc<Hub>,
}

impl EventBus {
    pub fn new(limits: HubLimits) -> Self {
        Self {
            hub: Arc::new(Hub {
                limits,
                sessions: DashMap::new(),
                rooms: DashMap::new(),
                user_sessions: DashMap::new(),
                total: AtomicUsize::new(0),
            }),
        }
    }

    /// Register an authenticated connection. Dropping the returned handle
    /// removes the session and every room subscription it holds.
    pub fn register(&self, user_id: i64) -> Result<SessionHandle, RegisterError> {
        if !self.try_acquire_global_slot() {
            return Err(RegisterError::GlobalCapacity);
        }
        {
            let mut count = self.hub.user_sessions.entry(user_id).or_insert(0);
            if *count >= self.hub.limits.max_sessions_per_user {
                drop(count);
                self.hub.total.fetch_sub(1, Ordering::SeqCst);
                return Err(RegisterError::UserCapacity);
            }
            *count += 1;
        }

        let session_id = new_session_id();
        let (sender, receiver) = mpsc::channel(self.hub.limits.queue_capacity.max(1));
        let evicted = CancellationToken::new();
        self.hub.sessions.insert(
            session_id.clone(),
            SessionEntry {
                user_id,
                sender,
                evicted: evicted.clone(),
                rooms: HashSet::new(),
            },
        );
        tracing::debug!(user_id, session_id = %session_id, "gateway session registered");

        Ok(SessionHandle {
            session_id,
            user_id,
            receiver,
            evicted,
            bus: self.clone(),
        })
    }

    fn try_acquire_global_slot(&self) -> bool {
        let max = self.hub.limits.max_sessions_total;
        let mut current = self.hub.total.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return false;
            }
            match self.hub.total.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn join(&self, session_id: &str, conversation_id: i64) -> bool {
        let Some(mut session) = self.hub.sessions.get_mut(session_id) else {
            return false;
        };
        session.rooms.insert(conversation_id);
        self.hub
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(session_id.to_string());
        true
    }

    fn leave(&self, session_id: &str, conversation_id: i64) {
        if let Some(mut session) = self.hub.sessions.get_mut(session_id) {
            session.rooms.remove(&conversation_id);
            self.remove_from_room(session_id, conversation_id);
        }
    }

    fn remove_from_room(&self, session_id: &str, conversation_id: i64) {
        if let Some(mut members) = self.hub.rooms.get_mut(&conversation_id) {
            members.remove(session_id);
        }
        self.hub
            .rooms
            .remove_if(&conversation_id, |_, members| members.is_empty());
    }

    fn unregister(&self, session_id: &str) {
        let Some((_, session)) = self.hub.sessions.remove(session_id) else {
            return;
        };
        for conversation_id in &session.rooms {
            self.remove_from_room(session_id, *conversation_id);
        }
        if let Some(mut count) = self.hub.user_sessions.get_mut(&session.user_id) {
            *count = count.saturating_sub(1);
        }
        self.hub
            .user_sessions
            .remove_if(&session.user_id, |_, count| *count == 0);
        self.hub.total.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(user_id = session.user_id, session_id, "gateway session removed");
    }

    /// Queue `frame` for every session in the conversation's room.
    /// Returns the number of sessions it was queued for.
    pub fn publish(&self, conversation_id: i64, frame: Frame) -> usize {
        let targets: Vec<String> = match self.hub.rooms.get(&conversation_id) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut slow = Vec::new();
        for session_id in targets {
            let Some(session) = self.hub.sessions.get(&session_id) else {
                continue;
            };
            match session.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slow.push((session_id.clone(), session.user_id, session.evicted.clone()));
                }
                // Receiver already gone; its handle is being dropped.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for (session_id, user_id, evicted) in slow {
            tracing::warn!(
                user_id,
                session_id = %session_id,
                conversation_id,
                "evicting slow gateway session"
            );
            evicted.cancel();
            self.unregister(&session_id);
        }
        delivered
    }

    pub fn publish_message_created(&self, message: &Message) -> Result<usize, CoreError> {
        let frame = dispatch_frame(EVENT_MESSAGE_CREATE, message)?;
        Ok(self.publish(message.conversation_id, frame))
    }

    pub fn room_size(&self, conversation_id: i64) -> usize {
        self.hub
            .rooms
            .get(&conversation_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.hub.total.load(Ordering::SeqCst)
    }

    pub fn user_session_count(&self, user_id: i64) -> usize {
        self.hub
            .user_sessions
            .get(&user_id)
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(HubLimits::default())
    }
}

/// Serialize a DISPATCH frame once so fan-out only clones a pointer.
pub fn dispatch_frame<T: serde::Serialize>(event_type: &str, payload: &T) -> Result<Frame, CoreError> {
    let d = serde_json::to_value(payload).map_err(|e| CoreError::Internal(e.to_string()))?;
    let mut msg = GatewayMessage::new(OP_DISPATCH, d);
    msg.t = Some(event_type.to_string());
    let text = serde_json::to_string(&msg).map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(Arc::from(text))
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One live gateway connection's view of the hub.
pub struct SessionHandle {
    pub session_id: String,
    pub user_id: i64,
    receiver: mpsc::Receiver<Frame>,
    evicted: CancellationToken,
    bus: EventBus,
}

impl SessionHandle {
    /// Subscribe to a conversation's room. Membership must be checked by
    /// the caller first.
    pub fn join(&self, conversation_id: i64) -> bool {
        self.bus.join(&self.session_id, conversation_id)
    }

    /// Idempotent.
    pub fn leave(&self, conversation_id: i64) {
        self.bus.leave(&self.session_id, conversation_id);
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Cancelled when the hub gives up on this session.
    pub fn evicted(&self) -> CancellationToken {
        self.evicted.clone()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.bus.unregister(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_user: usize, total: usize, queue: usize) -> HubLimits {
        HubLimits {
            max_sessions_per_user: per_user,
            max_sessions_total: total,
            queue_capacity: queue,
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_room_members() {
        let bus = EventBus::default();
        let mut a = bus.register(1).unwrap();
        let mut b = bus.register(2).unwrap();
        let mut c = bus.register(3).unwrap();
        assert!(a.join(10));
        assert!(b.join(10));
        assert!(c.join(20));

        assert_eq!(bus.publish(10, Arc::from("hello")), 2);
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
        assert!(c.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let bus = EventBus::default();
        let a = bus.register(1).unwrap();
        a.join(10);
        a.leave(10);
        a.leave(10);
        a.leave(99);
        assert_eq!(bus.room_size(10), 0);
        assert_eq!(bus.publish(10, Arc::from("x")), 0);
    }

    #[tokio::test]
    async fn dropping_handle_clears_rooms_and_counts() {
        let bus = EventBus::default();
        let a = bus.register(1).unwrap();
        a.join(10);
        a.join(11);
        assert_eq!(bus.session_count(), 1);
        drop(a);
        assert_eq!(bus.room_size(10), 0);
        assert_eq!(bus.room_size(11), 0);
        assert_eq!(bus.session_count(), 0);
        assert_eq!(bus.user_session_count(1), 0);
    }

    #[tokio::test]
    async fn connection_caps_are_enforced() {
        let bus = EventBus::new(limits(2, 3, 8));
        let _a1 = bus.register(1).unwrap();
        let a2 = bus.register(1).unwrap();
        assert_eq!(bus.register(1).err(), Some(RegisterError::UserCapacity));
        let _b1 = bus.register(2).unwrap();
        assert_eq!(bus.register(3).err(), Some(RegisterError::GlobalCapacity));

        drop(a2);
        assert!(bus.register(3).is_ok());
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_session() {
        let bus = EventBus::new(limits(5, 10, 1));
        let slow = bus.register(1).unwrap();
        let mut fast = bus.register(2).unwrap();
        slow.join(10);
        fast.join(10);
        let evicted = slow.evicted();

        assert_eq!(bus.publish(10, Arc::from("one")), 2);
        assert_eq!(fast.recv().await.as_deref(), Some("one"));
        assert_eq!(bus.publish(10, Arc::from("two")), 1);

        assert!(evicted.is_cancelled());
        assert_eq!(bus.room_size(10), 1);
        assert_eq!(fast.recv().await.as_deref(), Some("two"));
    }

    #[test]
    fn dispatch_frame_is_tagged() {
        let frame = dispatch_frame("MESSAGE_CREATE", &serde_json::json!({"k": 1})).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["op"], 0);
        assert_eq!(parsed["t"], "MESSAGE_CREATE");
        assert_eq!(parsed["d"]["k"], 1);
    }
}
