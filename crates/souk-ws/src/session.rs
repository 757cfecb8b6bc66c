use souk_core::events::SessionHandle;
use std::collections::BTreeSet;

/// Per-connection state once IDENTIFY succeeded.
pub struct Session {
    pub handle: SessionHandle,
    joined: BTreeSet<i64>,
}

impl Session {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            joined: BTreeSet::new(),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.handle.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    /// Subscribe to the room. Membership must already be verified.
    pub fn join(&mut self, conversation_id: i64) {
        if self.handle.join(conversation_id) {
            self.joined.insert(conversation_id);
        }
    }

    pub fn leave(&mut self, conversation_id: i64) {
        self.handle.leave(conversation_id);
        self.joined.remove(&conversation_id);
    }

    pub fn joined_rooms(&self) -> usize {
        self.joined.len()
    }
}
