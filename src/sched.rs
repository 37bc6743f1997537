//! Scheduler boundary.
//!
//! The IPC core never owns scheduling. It asks the surrounding kernel to
//! unblock a receiver, to prefer it for the next scheduling decision after a
//! direct hand-off, and to park a blocked receiver. This trait is that
//! boundary; [`HostScheduler`] is the multi-threaded host rendition where
//! "yield to" becomes a recorded preference plus an OS yield.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::message::Pid;

/// Operations the IPC core requires from the process scheduler.
pub trait Scheduler: Send + Sync {
    /// Inserts `pid` into the run queue.
    fn enqueue(&self, pid: Pid);

    /// Makes `pid` runnable again after a block.
    fn unblock(&self, pid: Pid);

    /// Marks `pid` as the preferred target of the next scheduling decision
    /// and gives up the current timeslice.
    fn yield_to(&self, pid: Pid);

    /// Parks `pid`. Returns false if the scheduler refused the block.
    /// `timeout` of `None` means the caller manages its own deadline.
    fn block_on(&self, pid: Pid, timeout: Option<Duration>) -> bool;
}

/// Host-thread scheduler: blocking is delegated to the OS (the IPC monitor
/// already parks the thread), so this implementation only tracks state the
/// kernel would act on.
#[derive(Default)]
pub struct HostScheduler {
    current: AtomicI64,
    run_queue: Mutex<VecDeque<Pid>>,
    blocked: Mutex<HashSet<Pid>>,
}

impl HostScheduler {
    /// New scheduler with no preferred pid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid most recently yielded to; 0 when none.
    pub fn current(&self) -> Pid {
        self.current.load(Ordering::Acquire)
    }

    /// True when `pid` sits in the run queue.
    pub fn is_runnable(&self, pid: Pid) -> bool {
        self.run_queue.lock().map(|q| q.contains(&pid)).unwrap_or(false)
    }
}

impl Scheduler for HostScheduler {
    fn enqueue(&self, pid: Pid) {
        if let Ok(mut q) = self.run_queue.lock() {
            if !q.contains(&pid) {
                q.push_back(pid);
            }
        }
    }

    fn unblock(&self, pid: Pid) {
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.remove(&pid);
        }
        self.enqueue(pid);
    }

    fn yield_to(&self, pid: Pid) {
        self.current.store(pid, Ordering::Release);
        std::thread::yield_now();
    }

    fn block_on(&self, pid: Pid, _timeout: Option<Duration>) -> bool {
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.insert(pid);
        }
        if let Ok(mut q) = self.run_queue.lock() {
            q.retain(|&p| p != pid);
        }
        true
    }
}
