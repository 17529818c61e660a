//! Output buffering for sessions without a live connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::manager::{event_channel, EventSender};
use crate::protocol::TerminalEvent;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Collects events per terminal until a client drains them. Each terminal
/// keeps at most `capacity` events; the oldest are dropped first.
#[derive(Clone)]
pub struct EventBuffer {
    events: Arc<Mutex<HashMap<String, VecDeque<TerminalEvent>>>>,
    capacity: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// A sender whose events land in this buffer.
    pub fn sender(&self) -> EventSender {
        let (tx, mut rx) = event_channel();
        let buffer = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                buffer.push(event).await;
            }
        });
        tx
    }

    async fn push(&self, event: TerminalEvent) {
        let Some(terminal_id) = event.terminal_id().map(str::to_string) else {
            debug!("Dropping unattributed terminal event: {:?}", event);
            return;
        };
        let mut events = self.events.lock().await;
        let queue = events.entry(terminal_id).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Everything buffered for `terminal_id`, oldest first. The entry is
    /// forgotten once its disconnect has been drained.
    pub async fn drain(&self, terminal_id: &str) -> Vec<TerminalEvent> {
        let mut events = self.events.lock().await;
        let drained: Vec<TerminalEvent> = events
            .get_mut(terminal_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        if drained.last().is_some_and(TerminalEvent::is_disconnected) {
            events.remove(terminal_id);
        }
        drained
    }

    pub async fn contains(&self, terminal_id: &str) -> bool {
        self.events.lock().await.contains_key(terminal_id)
    }
}
