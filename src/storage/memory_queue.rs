use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::storage::{QueueError, QueueStore};

#[derive(Default)]
struct QueueState {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify
}

/// In-process list store with the move-and-claim semantics of a Redis
/// `BRPOPLPUSH`.
///
/// Clones share the same lists, so a buffer can be torn down and rebuilt on
/// top of the state a previous instance left behind.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<QueueState>
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.state.lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_move(&self, source: &str, destination: &str) -> Option<String> {
        let mut lists = self.lists();
        let item = lists.get_mut(source)?.pop_back()?;

        if lists.get(source).is_some_and(VecDeque::is_empty) {
            lists.remove(source);
        }

        lists.entry(destination.to_string()).or_default().push_front(item.clone());

        Some(item)
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn push(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.lists().entry(key.to_string()).or_default().push_front(value);
        self.state.pushed.notify_waiters();

        Ok(())
    }

    async fn move_next(&self, source: &str, destination: &str, wait: Option<Duration>) -> Result<Option<String>, QueueError> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            //NOTE: The waiter is registered before checking the list so a push landing in between is not missed
            let pushed = self.state.pushed.notified();

            if let Some(item) = self.try_move(source, destination) {
                return Ok(Some(item))
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    if timeout_at(deadline, pushed).await.is_err() {
                        return Ok(self.try_move(source, destination))
                    }
                }
                _ => return Ok(None)
            }
        }
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self.lists().get(key).map(|list| list.iter().cloned().collect()).unwrap_or_default())
    }

    async fn len(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.lists().get(key).map_or(0, VecDeque::len))
    }

    async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.lists().remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let mut keys: Vec<String> = self.lists().keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        keys.sort();

        Ok(keys)
    }
}
