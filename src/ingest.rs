//! Bounded worker pool feeding inbound messages to the filter engine.
//!
//! Transport listeners hand messages to [`IngestPool::submit`] instead of
//! evaluating rules on their own threads. Workers stop when the queue is
//! closed and drained, or as soon as the pool's [`CancellationToken`] is
//! cancelled.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::filter::FilterEngine;
use crate::types::RawMessage;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an idle worker waits before re-checking its token.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared stop flag for worker loops.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Counters since the pool started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Messages taken off the queue and evaluated.
    pub processed: u64,
    /// Successful deliveries those messages produced.
    pub delivered: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    delivered: AtomicU64,
}

pub struct IngestPool {
    sender: Mutex<Option<Sender<RawMessage>>>,
    token: CancellationToken,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestPool {
    /// Start `workers` threads draining a queue of `queue_size` messages.
    pub fn start(engine: Arc<FilterEngine>, workers: usize, queue_size: usize) -> Result<Self> {
        let (sender, receiver) = bounded(queue_size.max(1));
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let engine = Arc::clone(&engine);
            let receiver = receiver.clone();
            let token = token.clone();
            let counters = Arc::clone(&counters);

            let handle = thread::Builder::new()
                .name(format!("ingest-worker-{}", n))
                .spawn(move || run_worker(engine, receiver, token, counters))
                .map_err(|e| BrokerError::Spawn(e.to_string()))?;
            handles.push(handle);
        }

        debug!(workers = handles.len(), queue_size, "Ingest pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            token,
            counters,
            workers: Mutex::new(handles),
        })
    }

    /// Pool sized by `ingest_workers` and `ingest_queue_size`.
    pub fn from_config(engine: Arc<FilterEngine>, config: &BrokerConfig) -> Result<Self> {
        Self::start(engine, config.ingest_workers, config.ingest_queue_size)
    }

    /// Queue `raw` for evaluation, blocking while the queue is full.
    pub fn submit(&self, raw: RawMessage) -> Result<()> {
        let sender = self.live_sender()?;
        sender.send(raw).map_err(|_| BrokerError::IngestClosed)
    }

    /// Queue `raw` without blocking. Returns `false` if the queue is full
    /// and the message was dropped.
    pub fn try_submit(&self, raw: RawMessage) -> Result<bool> {
        let sender = self.live_sender()?;
        match sender.try_send(raw) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                warn!("Ingest queue full, dropping message");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(BrokerError::IngestClosed),
        }
    }

    /// Token observed by the workers; cancelling it stops them without
    /// draining the queue.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, let the workers drain it, and wait for them.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() && self.workers.lock().is_empty() {
            return;
        }

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Ingest worker panicked");
            }
        }
        self.token.cancel();

        let stats = self.stats();
        info!(processed = stats.processed, delivered = stats.delivered, "Ingest pool stopped");
    }

    fn live_sender(&self) -> Result<Sender<RawMessage>> {
        if self.token.is_cancelled() {
            return Err(BrokerError::IngestClosed);
        }
        self.sender.lock().clone().ok_or(BrokerError::IngestClosed)
    }
}

impl Drop for IngestPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    engine: Arc<FilterEngine>,
    receiver: Receiver<RawMessage>,
    token: CancellationToken,
    counters: Arc<Counters>,
) {
    while !token.is_cancelled() {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(raw) => {
                let delivered = engine.filter_message(raw);
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryEndpoint;
    use crate::filter::{DefaultTransformer, RegexPredicateCompiler};
    use crate::subscriptions::Subscription;
    use crate::types::{Payload, SubscribeOptions};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingEndpoint {
        count: AtomicUsize,
    }

    impl DeliveryEndpoint for CountingEndpoint {
        fn deliver(&self, _payload: &Payload, _raw: bool) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn effective_location(&self) -> String {
            "test:counting".to_string()
        }

        fn destroy(&self) {}
    }

    fn engine_with(endpoint: Arc<CountingEndpoint>, filter: &str) -> Arc<FilterEngine> {
        let engine = Arc::new(FilterEngine::new(
            Arc::new(RegexPredicateCompiler),
            Arc::new(DefaultTransformer::new()),
        ));
        let sub = Subscription::new(
            "s1",
            SubscribeOptions::new("p1").with_filter(filter, None),
            endpoint.clone(),
        );
        engine.register(&sub, endpoint).unwrap();
        engine
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let endpoint = Arc::new(CountingEndpoint::default());
        let pool = IngestPool::start(engine_with(endpoint.clone(), "^hit"), 3, 64).unwrap();

        for i in 0..50 {
            let text = if i % 2 == 0 { "hit" } else { "miss" };
            pool.submit(text.into()).unwrap();
        }
        pool.shutdown();

        assert_eq!(endpoint.count.load(Ordering::SeqCst), 25);
        assert_eq!(
            pool.stats(),
            IngestStats {
                processed: 50,
                delivered: 25
            }
        );
    }

    #[test]
    fn test_submit_after_shutdown() {
        let endpoint = Arc::new(CountingEndpoint::default());
        let pool = IngestPool::start(engine_with(endpoint, "x"), 1, 4).unwrap();
        pool.shutdown();

        assert!(matches!(pool.submit("x".into()), Err(BrokerError::IngestClosed)));
        assert!(matches!(pool.try_submit("x".into()), Err(BrokerError::IngestClosed)));
    }

    #[test]
    fn test_cancelled_token_rejects_and_stops() {
        let endpoint = Arc::new(CountingEndpoint::default());
        let pool = IngestPool::start(engine_with(endpoint, "x"), 2, 4).unwrap();

        pool.token().cancel();
        assert!(matches!(pool.submit("x".into()), Err(BrokerError::IngestClosed)));

        // Workers notice within a poll interval.
        pool.shutdown();
    }
}
