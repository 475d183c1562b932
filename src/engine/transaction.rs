use std::{collections::LinkedList, sync::Arc};

use parking_lot::{Condvar, Mutex};

use super::{job::Job, queue::JobList, Shared};

/// An ordered batch of [`Job`]s that the master loop applies as a whole.
///
/// Committing hands the jobs to the engine. Dropping an uncommitted
/// transaction dismisses it.
pub struct Transaction {
    jobs: JobList,
    shared: Arc<Shared>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            jobs: Vec::new(),
            shared,
        }
    }

    /// Append a job. Jobs run in the order they were added.
    pub fn add(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Move every job of `other` to the end of this transaction.
    pub fn merge(&mut self, mut other: Transaction) {
        self.jobs.append(&mut other.jobs);
    }

    /// Hand the transaction to the master loop.
    ///
    /// Returns the tick stamp at which the transaction is expected to take
    /// effect, or 0 if it was empty and therefore dismissed.
    pub fn commit(mut self) -> u64 {
        if self.jobs.is_empty() {
            return 0;
        }

        let jobs = std::mem::take(&mut self.jobs);
        let stamp = self.shared.queue.enqueue(jobs);
        self.shared.wakeup();
        stamp
    }

    /// Drop every job without executing it, running their free callbacks.
    pub fn dismiss(self) {
        // Handled by `Drop`.
    }

    /// Block until the engine reached `tick_stamp`, then commit.
    ///
    /// This registers a timer with the master loop which moves the jobs
    /// onto the queue at the right block, so the transaction takes effect
    /// at the next dispatch after `tick_stamp` was reached.
    pub fn commit_delayed(mut self, tick_stamp: u64) {
        if self.jobs.is_empty() {
            return;
        }
        if tick_stamp <= self.shared.tick_stamp() {
            self.commit();
            return;
        }

        let mut list = LinkedList::new();
        list.push_back(std::mem::take(&mut self.jobs));

        let signal = Arc::new(DelayedCommit {
            jobs: Mutex::new(Some(list)),
            cond: Condvar::new(),
        });

        let timer = {
            let signal = Arc::clone(&signal);
            let shared = Arc::downgrade(&self.shared);
            move |now: u64| {
                if now < tick_stamp {
                    return true;
                }

                let mut jobs = signal.jobs.lock();
                if let (Some(list), Some(shared)) = (jobs.as_mut(), shared.upgrade()) {
                    shared.queue.enqueue_list(list);
                }
                *jobs = None;
                drop(jobs);

                signal.cond.notify_all();
                false
            }
        };

        let mut wrapper = Transaction::new(Arc::clone(&self.shared));
        wrapper.add(Job::add_timer(timer, None));
        wrapper.commit();

        let mut jobs = signal.jobs.lock();
        while jobs.is_some() {
            signal.cond.wait(&mut jobs);
        }
    }
}

struct DelayedCommit {
    jobs: Mutex<Option<LinkedList<JobList>>>,
    cond: Condvar,
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for job in self.jobs.drain(..) {
            job.release(&self.shared);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("jobs", &self.jobs)
            .finish()
    }
}
