//! Timer-driven termination of expiring entities.

use crate::error::{panic_message, BrokerError, Result};
use crate::types::{Clock, Timestamp};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stale timer entries tolerated beyond twice the tracked jobs before the
/// heap is compacted.
const COMPACT_SLACK: usize = 64;

/// Anything with an end of life and an action to run when it is reached.
pub trait Terminatable: Send + Sync {
    /// Jobs are tracked per identity.
    fn identity(&self) -> &str;

    fn end_of_life(&self) -> Timestamp;

    fn terminate(&self) -> Result<()>;
}

/// A tracked job. Superseded or cancelled jobs leave a stale timer entry
/// behind until the heap is compacted; the generation tells them apart.
struct Job {
    generation: u64,
    end_of_life: Timestamp,
    terminatable: Arc<dyn Terminatable>,
}

#[derive(Default)]
struct Shared {
    jobs: Mutex<HashMap<String, Job>>,
    /// Heap size as last seen by the timer thread.
    queued_timers: AtomicUsize,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    due: Instant,
    generation: u64,
    identity: String,
}

enum TimerCommand {
    Schedule(TimerEntry),
    Shutdown,
}

/// Fires [`Terminatable::terminate`] at each job's end of life.
///
/// A dedicated timer thread owns the deadlines and hands due jobs to a
/// small worker pool, so callbacks never run on the scheduling thread and
/// a slow or failing callback cannot delay the others.
///
/// A due job is claimed by removing it from tracking under the job lock.
/// `cancel_termination` therefore either wins (the job never runs) or
/// reports `UnknownTerminatable` (the job has been claimed).
pub struct TerminationScheduler {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    commands: Sender<TimerCommand>,
    next_generation: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TerminationScheduler {
    /// Start the timer thread and `workers` callback threads.
    pub fn start(clock: Arc<dyn Clock>, workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = unbounded();
        let (job_tx, job_rx) = unbounded::<Arc<dyn Terminatable>>();

        let mut threads = Vec::with_capacity(workers.max(1) + 1);

        for n in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("termination-worker-{}", n))
                .spawn(move || run_worker(job_rx))
                .map_err(|e| BrokerError::Spawn(e.to_string()))?;
            threads.push(handle);
        }

        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name("termination-timer".to_string())
            .spawn(move || run_timer(timer_shared, command_rx, job_tx))
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;
        threads.push(timer);

        Ok(Self {
            shared,
            clock,
            commands,
            next_generation: AtomicU64::new(1),
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Schedule `terminatable` for its end of life, replacing any job
    /// already tracked for the same identity. An end of life in the past
    /// fires immediately on the scheduler's threads.
    pub fn schedule_termination(&self, terminatable: Arc<dyn Terminatable>) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BrokerError::SchedulerShutdown);
        }

        let identity = terminatable.identity().to_string();
        let end_of_life = terminatable.end_of_life();
        let delay = end_of_life
            .remaining_since(self.clock.now())
            .unwrap_or(Duration::ZERO);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut jobs = self.shared.jobs.lock();
            let replaced = jobs.insert(
                identity.clone(),
                Job {
                    generation,
                    end_of_life,
                    terminatable,
                },
            );
            if let Some(old) = replaced {
                debug!(%identity, old_end_of_life = %old.end_of_life, "Replaced pending termination");
            }
        }

        let entry = TimerEntry {
            due: Instant::now() + delay,
            generation,
            identity: identity.clone(),
        };

        if self.commands.send(TimerCommand::Schedule(entry)).is_err() {
            self.shared.jobs.lock().remove(&identity);
            return Err(BrokerError::SchedulerShutdown);
        }

        info!(%identity, %end_of_life, delay_ms = delay.as_millis() as u64, "Termination scheduled");
        Ok(())
    }

    /// Stop tracking the job for `identity`. Fails with
    /// `UnknownTerminatable` if none is pending, including when it already fired.
    pub fn cancel_termination(&self, identity: &str) -> Result<()> {
        match self.shared.jobs.lock().remove(identity) {
            Some(_) => {
                info!(%identity, "Termination cancelled");
                Ok(())
            }
            None => Err(BrokerError::UnknownTerminatable(identity.to_string())),
        }
    }

    pub fn is_scheduled(&self, identity: &str) -> bool {
        self.shared.jobs.lock().contains_key(identity)
    }

    /// End of life of the pending job for `identity`.
    pub fn scheduled_end_of_life(&self, identity: &str) -> Option<Timestamp> {
        self.shared.jobs.lock().get(identity).map(|j| j.end_of_life)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    /// Timer entries the timer thread holds, stale ones included.
    pub fn queued_timers(&self) -> usize {
        self.shared.queued_timers.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the timer and workers. Pending jobs are dropped without firing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let dropped = {
            let mut jobs = self.shared.jobs.lock();
            let count = jobs.len();
            jobs.clear();
            count
        };
        let _ = self.commands.send(TimerCommand::Shutdown);

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            // A callback may end up shutting the scheduler down from a worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Termination thread panicked");
            }
        }

        info!(dropped, "Termination scheduler stopped");
    }
}

impl Drop for TerminationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(
    shared: Arc<Shared>,
    commands: Receiver<TimerCommand>,
    jobs: Sender<Arc<dyn Terminatable>>,
) {
    let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while timers.peek().map_or(false, |Reverse(e)| e.due <= now) {
            if let Some(Reverse(entry)) = timers.pop() {
                claim(&shared, &jobs, entry);
            }
        }

        shared.queued_timers.store(timers.len(), Ordering::Release);

        let command = match timers.peek() {
            Some(Reverse(next)) => {
                match commands.recv_timeout(next.due.saturating_duration_since(now)) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Schedule(entry) => {
                timers.push(Reverse(entry));
                compact(&shared, &mut timers);
            }
            TimerCommand::Shutdown => break,
        }
    }

    debug!(abandoned = timers.len(), "Termination timer exiting");
}

/// Drop entries for cancelled or superseded jobs once they dominate the heap.
fn compact(shared: &Shared, timers: &mut BinaryHeap<Reverse<TimerEntry>>) {
    let jobs = shared.jobs.lock();
    if timers.len() <= jobs.len() * 2 + COMPACT_SLACK {
        return;
    }

    let before = timers.len();
    timers.retain(|Reverse(entry)| {
        jobs.get(&entry.identity).map_or(false, |job| job.generation == entry.generation)
    });
    debug!(before, after = timers.len(), "Compacted termination timers");
}

/// Hand a due job to the workers if it is still the tracked one.
fn claim(shared: &Shared, workers: &Sender<Arc<dyn Terminatable>>, entry: TimerEntry) {
    let job = {
        let mut jobs = shared.jobs.lock();
        match jobs.get(&entry.identity) {
            Some(job) if job.generation == entry.generation => jobs.remove(&entry.identity),
            _ => None,
        }
    };

    if let Some(job) = job {
        if workers.send(job.terminatable).is_err() {
            warn!(identity = %entry.identity, "No termination worker available");
        }
    }
}

fn run_worker(jobs: Receiver<Arc<dyn Terminatable>>) {
    for terminatable in jobs.iter() {
        let identity = terminatable.identity().to_string();
        match std::panic::catch_unwind(AssertUnwindSafe(|| terminatable.terminate())) {
            Ok(Ok(())) => info!(%identity, "Terminated"),
            Ok(Err(e)) => warn!(%identity, error = %e, "Termination failed"),
            Err(panic) => error!(
                %identity,
                panic = %panic_message(panic.as_ref()),
                "Termination panicked"
            ),
        }
    }
}
