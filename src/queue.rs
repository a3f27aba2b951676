//! Pending-job queue.
//!
//! Strict FIFO, with one exception: in drop-target wrappers, a burst of file
//! drops arriving while a run is active is merged into the tail job, so one
//! drag gesture of many files becomes one process. The queue also holds the
//! `busy`/`closed` flags so every trigger context makes its decision under the
//! same lock the controller dequeues under.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Result, ScriptExecError};
use crate::job::Job;

#[derive(Debug)]
struct QueuedJob {
    job: Job,
    /// Last time a drop was merged into (or created) this job
    touched: Instant,
}

/// What `enqueue` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { depth: usize },
    Coalesced { depth: usize },
}

impl EnqueueOutcome {
    pub fn depth(&self) -> usize {
        match *self {
            Self::Queued { depth } | Self::Coalesced { depth } => depth,
        }
    }
}

#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<QueuedJob>,
    capacity: usize,
    coalesce_window: Option<Duration>,
    busy: bool,
    closed: bool,
}

impl JobQueue {
    /// `coalesce_window` is `None` unless the wrapper is a drop target.
    pub fn new(capacity: usize, coalesce_window: Option<Duration>) -> Self {
        Self {
            jobs: VecDeque::new(),
            capacity: capacity.max(1),
            coalesce_window: coalesce_window.filter(|w| !w.is_zero()),
            busy: false,
            closed: false,
        }
    }

    pub fn enqueue(&mut self, job: Job, now: Instant) -> Result<EnqueueOutcome> {
        if self.closed {
            return Err(ScriptExecError::QueueClosed);
        }

        if self.should_coalesce(&job, now) {
            if let Some(tail) = self.jobs.back_mut() {
                tail.job.merge_args_from(job);
                tail.touched = now;
                return Ok(EnqueueOutcome::Coalesced {
                    depth: self.jobs.len(),
                });
            }
        }

        if self.jobs.len() >= self.capacity {
            return Err(ScriptExecError::Capacity {
                capacity: self.capacity,
            });
        }

        self.jobs.push_back(QueuedJob { job, touched: now });
        Ok(EnqueueOutcome::Queued {
            depth: self.jobs.len(),
        })
    }

    /// Put `job` ahead of everything queued. Capacity does not apply; the
    /// wrapper's own launch is never turned away for triggers that beat it.
    pub fn enqueue_first(&mut self, job: Job) -> Result<usize> {
        if self.closed {
            return Err(ScriptExecError::QueueClosed);
        }
        self.jobs.push_front(QueuedJob {
            job,
            touched: Instant::now(),
        });
        Ok(self.jobs.len())
    }

    fn should_coalesce(&self, job: &Job, now: Instant) -> bool {
        let (Some(window), Some(tail)) = (self.coalesce_window, self.jobs.back()) else {
            return false;
        };
        self.busy
            && job.is_mergeable_drop()
            && tail.job.is_mergeable_drop()
            && now.saturating_duration_since(tail.touched) <= window
    }

    pub fn dequeue(&mut self) -> Option<Job> {
        self.jobs.pop_front().map(|q| q.job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set by the controller while a run is active
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Stop accepting jobs; already queued jobs stay.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Drop everything still pending, returning how many jobs were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.jobs.len();
        self.jobs.clear();
        n
    }
}
