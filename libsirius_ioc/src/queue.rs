use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::QueueError;
use super::logging::{guarded, LogChannel};

const POLL_PERIOD: Duration = Duration::from_millis(50);

/// The deferred operation. The argument is `true` when the queue is being
/// drained on shutdown; the job should then skip its side-effect.
pub type Job = Box<dyn FnOnce(bool) + Send + 'static>;

/// A deferred side-effectful operation, consumed exactly once
pub struct WorkItem {
    pub label: String,
    job: Job,
}

impl WorkItem {
    pub fn new(label: &str, job: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            label: label.to_string(),
            job: Box::new(job),
        }
    }

    fn run(self, cancelled: bool) {
        (self.job)(cancelled)
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("label", &self.label).finish()
    }
}

/// Bounded FIFO of work items with a single consumer thread.
///
/// Enqueueing never blocks: when the queue is full the oldest item is dropped
/// (fresher setpoints supersede stale ones) and a warning goes to `Log-Mon`.
#[derive(Debug)]
pub struct WorkQueue {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    log: LogChannel,
    cancelled: Arc<AtomicBool>,
    dropped: AtomicU64,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(capacity: usize, log: LogChannel) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            log,
            cancelled: Arc::new(AtomicBool::new(false)),
            dropped: AtomicU64::new(0),
            consumer: Mutex::new(None),
        }
    }

    /// Spawn the consumer thread. Calling it twice is an error.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            return Err(QueueError::AlreadyStarted);
        }
        let rx = self.rx.clone();
        let cancelled = self.cancelled.clone();
        let log = self.log.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("work-queue"))
            .spawn(move || consume(rx, cancelled, log))?;
        *consumer = Some(handle);
        Ok(())
    }

    /// Append an item; drops the oldest queued item if the queue is full
    pub fn put(&self, item: WorkItem) {
        if self.cancelled.load(Ordering::SeqCst) {
            spdlog::debug!("Work queue is shut down, running {} as cancelled", item.label);
            item.run(true);
            return;
        }
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.log
                            .warn(&format!("Work queue full, dropped {}", oldest.label));
                    }
                    item = rejected;
                }
                Err(TrySendError::Disconnected(rejected)) => {
                    // Unreachable while self holds a receiver
                    rejected.run(true);
                    return;
                }
            }
        }
    }

    /// Convenience wrapper around [`WorkQueue::put`]
    pub fn submit(&self, label: &str, job: impl FnOnce(bool) + Send + 'static) {
        self.put(WorkItem::new(label, job))
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signal cancellation, drain the remaining items (each sees `cancelled`)
    /// and join the consumer.
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                spdlog::error!("Work queue consumer panicked");
            }
        } else {
            // Never started: drain here
            while let Ok(item) = self.rx.try_recv() {
                item.run(true);
            }
        }
    }
}

fn consume(rx: Receiver<WorkItem>, cancelled: Arc<AtomicBool>, log: LogChannel) {
    loop {
        match rx.recv_timeout(POLL_PERIOD) {
            Ok(item) => {
                let is_cancelled = cancelled.load(Ordering::SeqCst);
                let label = item.label.clone();
                guarded(&log, &label, || item.run(is_cancelled));
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    spdlog::debug!("Work queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDescriptor;
    use crate::database::Database;
    use crate::logging::LOG_CHANNEL;

    fn log() -> LogChannel {
        LogChannel::new(Arc::new(
            Database::create(vec![ChannelDescriptor::string(LOG_CHANNEL, "")]).unwrap(),
        ))
    }

    #[test]
    fn test_items_run_in_order() {
        let queue = WorkQueue::new(16, log());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            queue.submit(&format!("item {i}"), move |_| seen.lock().push(i));
        }
        queue.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        queue.shutdown();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let log = log();
        let queue = WorkQueue::new(2, log.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            queue.submit(&format!("Gap-SP {i}"), move |_| seen.lock().push(i));
        }
        assert_eq!(queue.dropped(), 1);
        assert!(log.last().contains("Gap-SP 0"));
        queue.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        queue.shutdown();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_shutdown_cancels_pending_items() {
        let queue = WorkQueue::new(8, log());
        let flags = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let flags = flags.clone();
            queue.submit("pending", move |cancelled| flags.lock().push(cancelled));
        }
        queue.shutdown();
        assert_eq!(*flags.lock(), vec![true, true, true]);
    }
}
