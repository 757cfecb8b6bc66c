use std::collections::BTreeMap;
use std::sync::Arc;

use souk_models::message::Message;
use tokio::sync::Mutex;

/// Timeline shared by the realtime reader, the fallback poll and the send
/// path.
pub type SharedTimeline = Arc<Mutex<MessageTimeline>>;

/// The messages of one conversation, ordered and deduplicated by id.
///
/// Live pushes and fallback re-fetches both go through [`merge`], so a
/// message delivered by both producers is shown once. Known ids are never
/// overwritten: messages are immutable once appended.
///
/// [`merge`]: MessageTimeline::merge
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: i64,
    messages: BTreeMap<i64, Message>,
}

impl MessageTimeline {
    pub fn new(conversation_id: i64) -> Self {
        Self {
            conversation_id,
            messages: BTreeMap::new(),
        }
    }

    pub fn shared(conversation_id: i64) -> SharedTimeline {
        Arc::new(Mutex::new(Self::new(conversation_id)))
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Insert unseen messages and return how many were new. Messages from
    /// other conversations are ignored.
    pub fn merge<I>(&mut self, incoming: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut inserted = 0;
        for message in incoming {
            if message.conversation_id != self.conversation_id {
                continue;
            }
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.messages.entry(message.id)
            {
                slot.insert(message);
                inserted += 1;
            }
        }
        inserted
    }

    pub fn insert(&mut self, message: Message) -> bool {
        self.merge(std::iter::once(message)) == 1
    }

    pub fn last_id(&self) -> Option<i64> {
        self.messages.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: i64) -> bool {
        self.messages.contains_key(&message_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.messages.keys().copied().collect()
    }

    /// The newest message carrying this client nonce.
    pub fn find_by_nonce(&self, nonce: &str) -> Option<&Message> {
        self.messages
            .values()
            .rev()
            .find(|m| m.nonce.as_deref() == Some(nonce))
    }
}
