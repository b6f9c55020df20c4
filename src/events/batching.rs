//! Batched delivery of tool-call telemetry
//!
//! Tool calls arrive far faster than observers care to see them. Events are
//! sampled on admission, queued without blocking the caller, and handed to a
//! flush function in batches: when the batch fills up or when the flush
//! interval ticks, whichever comes first. An optional rate limit caps how
//! many flushes happen per second; batches held back by the limit stay
//! buffered for the next window. When the buffer is full a tool call is
//! dropped as a whole: its end event follows a dropped start.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ids, Event, EventKind};
use crate::config::ToolCallEventsConfig;
use crate::workflow::MIN_POLL_INTERVAL;

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    /// Flush whatever is buffered at this interval
    pub flush_interval: Duration,
    /// Flush as soon as this many events are buffered
    pub batch_size: usize,
    /// Maximum flushes per second
    pub rate_limit: Option<u32>,
    /// Percentage of events admitted (1-100)
    pub sample_rate: u8,
    /// Events held before new ones are dropped
    pub capacity: usize,
}

impl BatchingConfig {
    /// Settings from the `[events.tool_calls]` section
    pub fn from_config(config: &ToolCallEventsConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            batch_size: config.batch_size,
            rate_limit: config.rate_limit,
            sample_rate: config.sample_rate,
            ..Self::default()
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            batch_size: 10,
            rate_limit: None,
            sample_rate: 100,
            capacity: 1000,
        }
    }
}

/// Producer handle; cheap to call from hot paths
#[derive(Debug)]
pub struct BatchingEmitter {
    tx: mpsc::Sender<Event>,
    sample_rate: u64,
    seen: AtomicU64,
}

impl BatchingEmitter {
    /// Start the flush task; it runs until `cancel` fires or every handle is dropped
    pub fn start<F>(config: BatchingConfig, flush: F, cancel: CancellationToken) -> (Self, JoinHandle<()>)
    where
        F: FnMut(Vec<Event>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let sample_rate = u64::from(config.sample_rate.clamp(1, 100));
        let handle = tokio::spawn(flush_loop(config, rx, flush, cancel));

        (
            Self {
                tx,
                sample_rate,
                seen: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// Queue an event; returns false if it was sampled out or dropped
    pub fn emit(&self, event: Event) -> bool {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        if n % 100 >= self.sample_rate {
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping tool-call event: {}", e);
                false
            }
        }
    }

    /// Queue a start/end pair for one observed tool call
    ///
    /// Sampling applies to the pair, so a call is never half-reported.
    pub fn emit_tool_call(&self, run_id: &str, name: &str) -> bool {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        if n % 100 >= self.sample_rate {
            return false;
        }

        let id = ids::tool_call_id();
        let start = Event::new(
            run_id,
            EventKind::ToolCallStart {
                tool_call_id: id.clone(),
                tool_call_name: name.to_string(),
            },
        );
        let end = Event::new(
            run_id,
            EventKind::ToolCallEnd {
                tool_call_id: id,
                tool_call_name: name.to_string(),
            },
        );

        // Both slots are reserved before either event is queued
        match self.tx.try_reserve_many(2) {
            Ok(mut permits) => {
                if let Some(p) = permits.next() {
                    p.send(start);
                }
                if let Some(p) = permits.next() {
                    p.send(end);
                }
                true
            }
            Err(e) => {
                debug!("Dropping tool call {}: {}", name, e);
                false
            }
        }
    }
}

async fn flush_loop<F>(
    config: BatchingConfig,
    mut rx: mpsc::Receiver<Event>,
    mut flush: F,
    cancel: CancellationToken,
) where
    F: FnMut(Vec<Event>),
{
    let batch_size = config.batch_size.max(1);
    let limit = config.capacity.max(batch_size).max(2);
    let mut buffer: Vec<Event> = Vec::with_capacity(batch_size);
    let mut dropped = HashSet::new();
    let mut limiter = config.rate_limit.map(RateWindow::new);

    let mut ticker = tokio::time::interval(config.flush_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    buffer.push(event);
                }
                break;
            }
            received = rx.recv() => match received {
                Some(event) => {
                    if !admit(&event, buffer.len(), limit, &mut dropped) {
                        continue;
                    }
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush_some(&mut buffer, batch_size, &mut limiter, &mut flush);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_some(&mut buffer, batch_size, &mut limiter, &mut flush);
                }
            }
        }
    }

    // Shutdown drains everything regardless of the rate limit
    while !buffer.is_empty() {
        let take = buffer.len().min(batch_size);
        flush(buffer.drain(..take).collect());
    }
}

/// Whether a buffer holding `len` of at most `limit` events takes `event`
///
/// A start needs room for its end too. An end is taken exactly when its
/// start was, so a full buffer never splits a pair.
fn admit(event: &Event, len: usize, limit: usize, dropped: &mut HashSet<String>) -> bool {
    match &event.kind {
        EventKind::ToolCallStart { tool_call_id, .. } if len + 2 > limit => {
            debug!("Tool-call buffer full, dropping call {}", tool_call_id);
            dropped.insert(tool_call_id.clone());
            false
        }
        EventKind::ToolCallStart { .. } => true,
        EventKind::ToolCallEnd { tool_call_id, .. } => !dropped.remove(tool_call_id),
        _ if len >= limit => {
            debug!("Tool-call buffer full, dropping {} event", event.event_type());
            false
        }
        _ => true,
    }
}

fn flush_some<F>(
    buffer: &mut Vec<Event>,
    batch_size: usize,
    limiter: &mut Option<RateWindow>,
    flush: &mut F,
) where
    F: FnMut(Vec<Event>),
{
    if let Some(window) = limiter {
        if !window.admit() {
            return;
        }
    }

    let take = buffer.len().min(batch_size);
    flush(buffer.drain(..take).collect());
}

/// Fixed one-second window counting flushes
#[derive(Debug)]
struct RateWindow {
    limit: u32,
    started: Instant,
    used: u32,
}

impl RateWindow {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            started: Instant::now(),
            used: 0,
        }
    }

    fn admit(&mut self) -> bool {
        if self.started.elapsed() >= Duration::from_secs(1) {
            self.started = Instant::now();
            self.used = 0;
        }
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Batches = Arc<Mutex<Vec<Vec<Event>>>>;

    fn collector() -> (Batches, impl FnMut(Vec<Event>) + Send + 'static) {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        (batches, move |batch| sink.lock().unwrap().push(batch))
    }

    fn tool_event(i: usize) -> Event {
        Event::new(
            "run",
            EventKind::ToolCallStart {
                tool_call_id: format!("tool-{}", i),
                tool_call_name: "Bash".to_string(),
            },
        )
    }

    fn flushed(batches: &Batches) -> usize {
        batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            flush_interval: Duration::from_millis(50),
            batch_size: 100,
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        assert!(emitter.emit(tool_event(0)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flushed(&batches), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flushes_on_batch_size() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            flush_interval: Duration::from_secs(60),
            batch_size: 3,
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        for i in 0..3 {
            emitter.emit(tool_event(i));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let batches = batches.lock().unwrap();
            // the interval's first tick fires immediately, so an early
            // partial batch is possible
            assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 3);
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_caps_flushes() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            flush_interval: Duration::from_millis(20),
            batch_size: 1,
            rate_limit: Some(2),
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        for i in 0..5 {
            emitter.emit(tool_event(i));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(batches.lock().unwrap().len(), 2);

        // shutdown flushes what the limiter held back
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(flushed(&batches), 5);
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            flush_interval: Duration::from_millis(10),
            batch_size: 5,
            capacity: 5,
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        let start = std::time::Instant::now();
        for i in 0..10 {
            emitter.emit(tool_event(i));
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let n = flushed(&batches);
        assert!(n > 0 && n <= 10);
    }

    #[tokio::test]
    async fn test_sample_rate() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            sample_rate: 25,
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        let admitted = (0..100).filter(|i| emitter.emit(tool_event(*i))).count();
        assert_eq!(admitted, 25);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(flushed(&batches), 25);
    }

    fn pair(id: &str) -> (Event, Event) {
        let start = Event::new(
            "run",
            EventKind::ToolCallStart {
                tool_call_id: id.to_string(),
                tool_call_name: "Bash".to_string(),
            },
        );
        let end = Event::new(
            "run",
            EventKind::ToolCallEnd {
                tool_call_id: id.to_string(),
                tool_call_name: "Bash".to_string(),
            },
        );
        (start, end)
    }

    #[test]
    fn test_full_buffer_keeps_pairs_whole() {
        let mut dropped = HashSet::new();

        // one slot left: the start would strand its end
        let (start, end) = pair("a");
        assert!(!admit(&start, 3, 4, &mut dropped));
        assert!(!admit(&end, 3, 4, &mut dropped));
        assert!(dropped.is_empty());

        // two slots left: the pair fits, and its end is taken at the limit
        let (start, end) = pair("b");
        assert!(admit(&start, 2, 4, &mut dropped));
        assert!(admit(&end, 3, 4, &mut dropped));
    }

    #[test]
    fn test_from_config() {
        let section = ToolCallEventsConfig {
            enabled: true,
            batch_size: 7,
            sample_rate: 50,
            flush_interval: Duration::from_millis(250),
            rate_limit: Some(3),
        };
        let config = BatchingConfig::from_config(&section);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.sample_rate, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.rate_limit, Some(3));
    }

    #[tokio::test]
    async fn test_overflow_never_splits_a_call() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let config = BatchingConfig {
            flush_interval: Duration::from_secs(60),
            batch_size: 100,
            capacity: 5,
            ..Default::default()
        };
        let (emitter, handle) = BatchingEmitter::start(config, sink, cancel.clone());

        for i in 0..20 {
            emitter.emit_tool_call("run", &format!("Tool{}", i));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events: Vec<Event> = batches.lock().unwrap().concat();
        assert!(!events.is_empty());
        // the interval's immediate first tick may flush once, nothing more
        assert!(events.len() < 40);
        for chunk in events.chunks(2) {
            assert_eq!(chunk.len(), 2);
            assert_eq!(chunk[0].event_type(), "tool_call_start");
            assert_eq!(chunk[1].event_type(), "tool_call_end");
            assert_eq!(chunk[0].correlation_id(), chunk[1].correlation_id());
        }
    }

    #[tokio::test]
    async fn test_tool_call_pair_order() {
        let (batches, sink) = collector();
        let cancel = CancellationToken::new();
        let (emitter, handle) =
            BatchingEmitter::start(BatchingConfig::default(), sink, cancel.clone());

        assert!(emitter.emit_tool_call("run", "Edit"));
        cancel.cancel();
        handle.await.unwrap();

        let events: Vec<Event> = batches.lock().unwrap().concat();
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["tool_call_start", "tool_call_end"]);
        assert_eq!(events[0].correlation_id(), events[1].correlation_id());
    }
}
