//! Delayed retry scheduler
//!
//! A single thread per agent holding a deadline heap. Retries are plain
//! closures; the scheduler only decides when they run.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{MemdError, Result};

type Task = Box<dyn FnOnce() + Send>;

struct Scheduled {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Runs closures after a delay on a dedicated thread
pub struct RetryScheduler {
    tx: Mutex<Option<Sender<(Instant, Task)>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn start() -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("memd-retry".to_string())
            .spawn(move || run(rx))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` once `delay` has passed
    ///
    /// Fails with [`MemdError::Shutdown`] once stopped; the task is dropped.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let due = Instant::now() + delay;
        let task: Task = Box::new(task);
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send((due, task))
                .map_err(|_| MemdError::Shutdown),
            None => Err(MemdError::Shutdown),
        }
    }

    /// Stop the thread; tasks still queued run immediately
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if crate::pipeline::on_io_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Retry scheduler panicked");
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<(Instant, Task)>) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while heap.peek().map_or(false, |Reverse(s)| s.due <= now) {
            if let Some(Reverse(scheduled)) = heap.pop() {
                (scheduled.task)();
            }
        }

        let received = match heap.peek() {
            Some(Reverse(next)) => rx.recv_timeout(next.due.saturating_duration_since(now)),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok((due, task)) => {
                seq += 1;
                heap.push(Reverse(Scheduled { due, seq, task }));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!("Retry scheduler draining {} tasks", heap.len());
    for Reverse(scheduled) in heap.into_sorted_vec().into_iter().rev() {
        (scheduled.task)();
    }
}
