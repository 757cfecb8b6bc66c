use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-conversation append lock.
///
/// Id allocation, the log write and the room broadcast for one message all
/// happen while the guard is held, so subscribers see messages in log order.
/// Entries disappear once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

pub struct AppendGuard {
    guard: Option<OwnedMutexGuard<()>>,
    conversation_id: i64,
    locks: ConversationLocks,
}

impl ConversationLocks {
    pub async fn acquire(&self, conversation_id: i64) -> AppendGuard {
        let mutex = self.inner.entry(conversation_id).or_default().clone();
        let guard = mutex.lock_owned().await;
        AppendGuard {
            guard: Some(guard),
            conversation_id,
            locks: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for AppendGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .inner
            .remove_if(&self.conversation_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
