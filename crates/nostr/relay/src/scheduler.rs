//! Deferred continuations.
//!
//! Multi-stage protocol work is split into separate dispatch passes. A stage
//! schedules the next stage here instead of emitting it directly, and the
//! queue only drains once the current call stack has unwound, so every
//! listener of stage N has seen (and possibly canceled) its envelope before
//! any stage N+1 work runs. Tasks run strictly in FIFO order; tasks queued by
//! a running task go to the back of the queue.

use crate::error::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::warn;

type Task = Box<dyn FnOnce() -> Result<()>>;

/// Single-threaded FIFO work queue shared by every dispatcher of one relay.
#[derive(Clone, Default)]
pub struct Scheduler {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Run queued tasks until the queue is empty. Returns how many ran.
    ///
    /// A failing task is logged and does not stop the tasks behind it.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            ran += 1;
            if let Err(e) = task() {
                warn!("Deferred task failed: {}", e);
            }
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("pending", &self.len()).finish()
    }
}
