//! Per-run subscriber registry
//!
//! Each subscriber gets its own bounded channel. Broadcasting never waits:
//! when a subscriber's channel is full the event is dropped for that
//! subscriber only, and subscribers whose receiver is gone are pruned.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Event, EventEmitter, EventKind, Streamer};
use crate::workflow::WorkflowState;
use crate::{Error, Result};

/// Default per-subscriber capacity
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Default subscriber limit for one run
pub const DEFAULT_MAX_CLIENTS: usize = 100;

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Receiving end handed to a subscriber
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub run_id: String,
    pub receiver: mpsc::Receiver<Event>,
}

/// Fans events out to every live subscriber of a run
#[derive(Debug)]
pub struct EventHub {
    buffer_size: usize,
    max_clients: usize,
    next_id: AtomicU64,
    runs: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl EventHub {
    pub fn new(buffer_size: usize, max_clients: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_clients,
            next_id: AtomicU64::new(1),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber for `run_id`
    pub fn subscribe(&self, run_id: &str) -> Result<Subscription> {
        let mut runs = self.runs();
        let subscribers = runs.entry(run_id.to_string()).or_default();

        if subscribers.len() >= self.max_clients {
            return Err(Error::Subscription(format!(
                "run {} already has {} subscribers",
                run_id, self.max_clients
            )));
        }

        let (tx, receiver) = mpsc::channel(self.buffer_size);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, tx });
        debug!("Subscriber {} joined run {}", id, run_id);

        Ok(Subscription {
            id,
            run_id: run_id.to_string(),
            receiver,
        })
    }

    /// Remove a subscriber; its receiver sees the channel close
    pub fn unsubscribe(&self, run_id: &str, id: u64) -> bool {
        let mut runs = self.runs();
        let Some(subscribers) = runs.get_mut(run_id) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            runs.remove(run_id);
        }
        if removed {
            debug!("Subscriber {} left run {}", id, run_id);
        }
        removed
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.runs().get(run_id).map(Vec::len).unwrap_or(0)
    }

    /// Deliver `event` to the subscribers of its run without waiting
    pub fn broadcast(&self, event: Event) {
        let mut runs = self.runs();
        let Some(subscribers) = runs.get_mut(&event.run_id) else {
            return;
        };

        subscribers.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    "Subscriber {} of run {} is full, dropping {}",
                    s.id,
                    event.run_id,
                    event.event_type()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            runs.remove(&event.run_id);
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CLIENTS)
    }
}

#[async_trait]
impl EventEmitter for EventHub {
    async fn run_started(&self, run_id: &str, task: &str) {
        self.broadcast(Event::new(run_id, EventKind::RunStarted { task: task.to_string() }));
    }

    async fn run_finished(&self, run_id: &str, task: &str) {
        self.broadcast(Event::new(run_id, EventKind::RunFinished { task: task.to_string() }));
    }

    async fn run_error(&self, run_id: &str, task: &str, error: &str) {
        self.broadcast(Event::new(
            run_id,
            EventKind::RunError {
                task: task.to_string(),
                error: error.to_string(),
            },
        ));
    }

    async fn state_snapshot(&self, run_id: &str, state: &WorkflowState) {
        self.broadcast(Event::new(run_id, EventKind::StateSnapshot { state: state.clone() }));
    }
}

impl Streamer for EventHub {
    fn stream_start(&self, run_id: &str, message_id: &str) {
        self.broadcast(Event::new(
            run_id,
            EventKind::TextMessageStart {
                message_id: message_id.to_string(),
            },
        ));
    }

    fn stream_content(&self, run_id: &str, message_id: &str, content: &str) {
        self.broadcast(Event::new(
            run_id,
            EventKind::TextMessageContent {
                message_id: message_id.to_string(),
                content: content.to_string(),
            },
        ));
    }

    fn stream_end(&self, run_id: &str, message_id: &str) {
        self.broadcast(Event::new(
            run_id,
            EventKind::TextMessageEnd {
                message_id: message_id.to_string(),
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn drain(sub: &mut Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = sub.receiver.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_events_are_scoped_to_run() {
        let hub = EventHub::default();
        let mut a = hub.subscribe("run-a").unwrap();
        let mut b = hub.subscribe("run-b").unwrap();

        hub.run_started("run-a", "task").await;

        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_message_order_for_every_subscriber() {
        let hub = EventHub::default();
        let mut subs: Vec<_> = (0..3).map(|_| hub.subscribe("run").unwrap()).collect();

        hub.stream_start("run", "msg-1");
        for i in 0..5 {
            hub.stream_content("run", "msg-1", &format!("line {}\n", i));
        }
        hub.stream_end("run", "msg-1");

        for sub in &mut subs {
            let types: Vec<_> = drain(sub).iter().map(|e| e.event_type()).collect();
            assert_eq!(types.first(), Some(&"text_message_start"));
            assert_eq!(types.last(), Some(&"text_message_end"));
            assert_eq!(types.len(), 7);
            assert!(types[1..6].iter().all(|t| *t == "text_message_content"));
        }
    }

    #[test]
    fn test_emitting_never_suspends() {
        let hub = EventHub::new(1, 10);
        let _sub = hub.subscribe("run").unwrap();

        // the second event finds the channel full and is dropped in place
        for _ in 0..2 {
            let mut emit = tokio_test::task::spawn(hub.run_started("run", "task"));
            tokio_test::assert_ready!(emit.poll());
        }
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let hub = EventHub::new(2, 10);
        let mut slow = hub.subscribe("run").unwrap();
        let mut fast = hub.subscribe("run").unwrap();

        let start = Instant::now();
        for i in 0..1000 {
            hub.stream_content("run", "msg", &i.to_string());
            // keep one subscriber drained
            let _ = fast.receiver.try_recv();
        }
        assert!(start.elapsed() < Duration::from_millis(500));

        // slow one kept the oldest events, newer ones were dropped
        let kept = drain(&mut slow);
        assert_eq!(kept.len(), 2);
        assert!(matches!(
            &kept[0].kind,
            EventKind::TextMessageContent { content, .. } if content == "0"
        ));
        assert_eq!(hub.subscriber_count("run"), 2);
    }

    #[test]
    fn test_max_clients() {
        let hub = EventHub::new(10, 2);
        let _a = hub.subscribe("run").unwrap();
        let _b = hub.subscribe("run").unwrap();

        assert!(matches!(hub.subscribe("run"), Err(Error::Subscription(_))));
        assert!(hub.subscribe("other").is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let hub = EventHub::default();
        let mut sub = hub.subscribe("run").unwrap();

        assert!(hub.unsubscribe("run", sub.id));
        assert!(!hub.unsubscribe("run", sub.id));
        assert_eq!(hub.subscriber_count("run"), 0);
        assert!(sub.receiver.recv().await.is_none());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let hub = EventHub::default();
        let sub = hub.subscribe("run").unwrap();
        drop(sub);

        hub.stream_start("run", "msg");
        assert_eq!(hub.subscriber_count("run"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_receive_everything() {
        let hub = Arc::new(EventHub::new(1000, 10));
        let subs: Vec<_> = (0..4).map(|_| hub.subscribe("run").unwrap()).collect();

        let readers: Vec<_> = subs
            .into_iter()
            .map(|mut sub| {
                tokio::spawn(async move {
                    let mut n = 0;
                    while let Some(e) = sub.receiver.recv().await {
                        n += 1;
                        if e.is_terminal() {
                            break;
                        }
                    }
                    n
                })
            })
            .collect();

        for i in 0..50 {
            hub.stream_content("run", "msg", &i.to_string());
        }
        hub.run_finished("run", "task").await;

        for r in readers {
            assert_eq!(r.await.unwrap(), 51);
        }
    }
}
