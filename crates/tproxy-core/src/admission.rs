//! Per-class bounded concurrency with priority-ordered queues.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tproxy_common::ModelClass;

pub const STANDARD_PRIORITY: i32 = 10;
pub const THINKING_PRIORITY: i32 = 0;

/// Standard requests always outrank thinking requests in the queue.
pub fn priority_for(class: ModelClass) -> i32 {
    match class {
        ModelClass::Standard => STANDARD_PRIORITY,
        ModelClass::Thinking => THINKING_PRIORITY,
    }
}

#[derive(Debug)]
struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct ClassQueue {
    max_concurrency: usize,
    running: usize,
    waiters: BinaryHeap<Waiter>,
    started: u64,
    completed: u64,
}

impl ClassQueue {
    fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            running: 0,
            waiters: BinaryHeap::new(),
            started: 0,
            completed: 0,
        }
    }

    /// Hands free slots to queued waiters, skipping any that went away.
    fn drain(&mut self) {
        while self.running < self.max_concurrency {
            let Some(waiter) = self.waiters.pop() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                self.running += 1;
                self.started += 1;
            }
        }
    }

    fn release(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
        self.drain();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub class: ModelClass,
    pub running: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub started: u64,
    pub completed: u64,
}

#[derive(Debug)]
pub struct AdmissionController {
    queues: Mutex<[ClassQueue; 2]>,
    seq: AtomicU64,
}

fn slot(class: ModelClass) -> usize {
    match class {
        ModelClass::Thinking => 0,
        ModelClass::Standard => 1,
    }
}

impl AdmissionController {
    pub fn new(thinking_max: usize, standard_max: usize) -> Self {
        Self {
            queues: Mutex::new([ClassQueue::new(thinking_max), ClassQueue::new(standard_max)]),
            seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [ClassQueue; 2]> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a slot in `class`. Dropping the returned permit releases the
    /// slot; dropping the future while queued leaves the queue.
    pub async fn acquire(self: &Arc<Self>, class: ModelClass, priority: i32) -> AdmissionPermit {
        loop {
            let (seq, rx) = {
                let mut queues = self.lock();
                let queue = &mut queues[slot(class)];
                if queue.running < queue.max_concurrency && queue.waiters.is_empty() {
                    queue.running += 1;
                    queue.started += 1;
                    return AdmissionPermit {
                        controller: self.clone(),
                        class,
                    };
                }
                let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                queue.waiters.push(Waiter { priority, seq, tx });
                (seq, rx)
            };

            let mut pending = PendingAdmission {
                controller: self.clone(),
                class,
                seq,
                settled: false,
            };
            let granted = rx.await.is_ok();
            pending.settled = true;
            if granted {
                return AdmissionPermit {
                    controller: self.clone(),
                    class,
                };
            }
        }
    }

    /// Runs `task` once admitted; the slot is released when it completes.
    pub async fn run<F, T>(self: &Arc<Self>, class: ModelClass, priority: i32, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(class, priority).await;
        task.await
    }

    /// Updates the bound (0 is treated as 1) and admits waiters that now fit.
    pub fn set_max_concurrency(&self, class: ModelClass, max_concurrency: usize) {
        let mut queues = self.lock();
        let queue = &mut queues[slot(class)];
        queue.max_concurrency = max_concurrency.max(1);
        queue.drain();
    }

    pub fn stats(&self, class: ModelClass) -> ClassStats {
        let queues = self.lock();
        let queue = &queues[slot(class)];
        ClassStats {
            class,
            running: queue.running,
            queued: queue.waiters.len(),
            max_concurrency: queue.max_concurrency,
            started: queue.started,
            completed: queue.completed,
        }
    }

    pub fn all_stats(&self) -> Vec<ClassStats> {
        ModelClass::ALL.iter().map(|class| self.stats(*class)).collect()
    }

    fn release(&self, class: ModelClass) {
        self.lock()[slot(class)].release();
    }
}

/// Holds one admission slot until dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    class: ModelClass,
}

impl AdmissionPermit {
    pub fn class(&self) -> ModelClass {
        self.class
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.class);
    }
}

/// Cleans up a queued waiter whose future was dropped before it settled.
struct PendingAdmission {
    controller: Arc<AdmissionController>,
    class: ModelClass,
    seq: u64,
    settled: bool,
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut queues = self.controller.lock();
        let queue = &mut queues[slot(self.class)];
        let before = queue.waiters.len();
        queue.waiters.retain(|waiter| waiter.seq != self.seq);
        if queue.waiters.len() == before {
            // Already popped and granted under the lock: hand the slot on.
            queue.release();
        }
    }
}
