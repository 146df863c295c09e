//! A serial work queue used as execution context by [`MemoryService`](crate::memory::MemoryService).
//!
//! Jobs run one at a time on a dedicated thread, in submission order. Delayed jobs run once their
//! deadline passed, ordered by deadline.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Execute { at: Instant, job: Job },
    Shutdown,
}

/// Handle to a serial work queue. Clones refer to the same queue.
///
/// The worker thread exits once the last handle is dropped; jobs still pending at that point are
/// discarded.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    label: String,
    tx: Sender<Message>,
    thread_id: ThreadId,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Spawns the worker thread.
    pub fn new(label: &str) -> crate::Result<Self> {
        let (tx, rx) = unbounded();
        let thread_handle = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || run(rx))?;
        let thread_id = thread_handle.thread().id();

        Ok(SerialQueue {
            inner: Arc::new(QueueInner {
                label: label.to_string(),
                tx,
                thread_id,
                thread_handle: Mutex::new(Some(thread_handle)),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// True when called from a job running on this queue.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Queues `job` behind everything submitted so far.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_at(Instant::now(), Box::new(job));
    }

    /// Queues `job` to run no earlier than `delay` from now.
    pub fn execute_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_at(Instant::now() + delay, Box::new(job));
    }

    /// Runs `job` on the queue and blocks until it returned.
    ///
    /// Runs the job inline when already on the queue, which would otherwise deadlock.
    ///
    /// # Panics
    ///
    /// If the job panics.
    pub fn sync<F, R>(&self, job: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return job();
        }

        let (tx, rx) = bounded(1);
        self.execute(move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("serial queue job to complete")
    }

    fn execute_at(&self, at: Instant, job: Job) {
        if self.inner.tx.send(Message::Execute { at, job }).is_err() {
            log::error!("serial queue {} is gone, dropping job", self.inner.label);
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.inner.label)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl PartialEq for SerialQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SerialQueue {}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        // The last handle may be dropped by a job on the queue itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self
            .thread_handle
            .lock()
            .ok()
            .and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct Delayed {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

fn run(rx: Receiver<Message>) {
    let mut timers: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|Reverse(next)| next.at <= now) {
            if let Some(Reverse(due)) = timers.pop() {
                run_job(due.job);
            }
        }

        let message = match timers.peek() {
            Some(Reverse(next)) => {
                match rx.recv_timeout(next.at.saturating_duration_since(Instant::now())) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        match message {
            Message::Execute { at, job } => {
                if at <= Instant::now() && timers.is_empty() {
                    run_job(job);
                } else {
                    seq += 1;
                    timers.push(Reverse(Delayed { at, seq, job }));
                }
            }
            Message::Shutdown => break,
        }
    }
}

fn run_job(job: Job) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        log::error!("job on serial queue panicked: {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_in_order() {
        let queue = SerialQueue::new("test-order").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            queue.execute(move || tx.send(i).unwrap());
        }
        let seen: Vec<_> = rx.iter().take(100).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_jobs_run_after_immediate_ones() {
        let queue = SerialQueue::new("test-delay").unwrap();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let tx2 = tx.clone();
        queue.execute_after(Duration::from_millis(100), move || tx2.send("late").unwrap());
        queue.execute(move || tx.send("now").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "now");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn sync_returns_value_and_runs_inline_on_queue() {
        let queue = SerialQueue::new("test-sync").unwrap();
        assert!(!queue.is_current());
        assert_eq!(queue.sync(|| 21 * 2), 42);

        let inner = queue.clone();
        let nested = queue.sync(move || (inner.is_current(), inner.sync(|| "inline")));
        assert_eq!(nested, (true, "inline"));
    }

    #[test]
    fn survives_panicking_job() {
        let queue = SerialQueue::new("test-panic").unwrap();
        queue.execute(|| panic!("boom"));
        assert_eq!(queue.sync(|| 1), 1);
    }

    #[test]
    fn clones_are_the_same_queue() {
        let queue = SerialQueue::new("test-eq").unwrap();
        let other = SerialQueue::new("test-eq").unwrap();
        assert_eq!(queue, queue.clone());
        assert_ne!(queue, other);
        assert_eq!(queue.label(), "test-eq");
    }
}
