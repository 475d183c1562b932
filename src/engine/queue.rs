use std::collections::LinkedList;

use parking_lot::{Condvar, Mutex};

use super::job::Job;

/// The jobs of one committed transaction.
pub(crate) type JobList = Vec<Job>;

#[derive(Default)]
struct QueueState {
    /// Committed transactions, in commit order.
    pending: LinkedList<JobList>,
    /// Executed transactions waiting for garbage collection.
    trash: LinkedList<JobList>,
    /// Set while the master loop executes a batch of transactions.
    in_flight: bool,
    commit_base_stamp: u64,
}

/// Hands committed transactions from user threads to the master loop.
///
/// Transactions become visible to the master loop as a whole, and are
/// executed in commit order. The lock is only held for list splicing,
/// which never allocates, so the realtime thread can take it safely.
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    block_size: u64,
}

impl JobQueue {
    pub fn new(block_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            block_size: block_size as u64,
        }
    }

    /// Append a transaction and return the tick stamp at which it will
    /// take effect.
    pub fn enqueue(&self, jobs: JobList) -> u64 {
        // Allocate the list node outside of the lock.
        let mut list = LinkedList::new();
        list.push_back(jobs);
        self.enqueue_list(&mut list)
    }

    /// Splice preallocated transactions onto the pending list.
    pub fn enqueue_list(&self, list: &mut LinkedList<JobList>) -> u64 {
        let mut state = self.state.lock();
        state.pending.append(list);
        state.commit_base_stamp + self.block_size
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Retire the previous batch into the trash and take every pending
    /// transaction as the next batch.
    ///
    /// Returns `false` and wakes up waiting user threads once there is
    /// nothing left to execute.
    pub fn swap_active(&self, active: &mut LinkedList<JobList>, tick_stamp: u64) -> bool {
        let mut state = self.state.lock();
        state.trash.append(active);
        std::mem::swap(&mut state.pending, active);

        if active.is_empty() {
            state.in_flight = false;
            state.commit_base_stamp = tick_stamp;
            drop(state);

            self.cond.notify_all();
            false
        } else {
            state.in_flight = true;
            true
        }
    }

    /// Block until the master loop has executed every committed
    /// transaction.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.in_flight || !state.pending.is_empty() {
            self.cond.wait(&mut state);
        }
    }

    /// Move jobs straight to the trash, skipping the master loop.
    pub fn push_trash(&self, jobs: JobList) {
        let mut list = LinkedList::new();
        list.push_back(jobs);
        self.state.lock().trash.append(&mut list);
    }

    /// Take every transaction the master loop has not picked up yet.
    pub fn take_pending(&self) -> LinkedList<JobList> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub fn take_trash(&self) -> LinkedList<JobList> {
        std::mem::take(&mut self.state.lock().trash)
    }

    pub fn has_trash(&self) -> bool {
        !self.state.lock().trash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &LinkedList<JobList>) -> Vec<&'static str> {
        list.iter().flatten().map(|j| j.name()).collect()
    }

    #[test]
    fn batches_keep_commit_order() {
        let queue = JobQueue::new(64);

        assert_eq!(queue.enqueue(vec![Job::nop(), Job::debug("a")]), 64);
        assert_eq!(queue.enqueue(vec![Job::debug("b")]), 64);
        assert!(queue.has_pending());

        let mut active = LinkedList::new();
        assert!(queue.swap_active(&mut active, 0));
        assert_eq!(names(&active), vec!["nop", "debug", "debug"]);
        assert!(!queue.has_pending());
        assert!(!queue.has_trash());

        // Drained dry, the previous batch moves to the trash.
        assert!(!queue.swap_active(&mut active, 128));
        assert!(active.is_empty());
        assert!(queue.has_trash());
        assert_eq!(names(&queue.take_trash()), vec!["nop", "debug", "debug"]);

        // The commit stamp follows the master loop.
        assert_eq!(queue.enqueue(vec![Job::nop()]), 192);
    }

    #[test]
    fn trash_bypasses_the_master() {
        let queue = JobQueue::new(64);
        queue.enqueue(vec![Job::nop()]);
        queue.push_trash(vec![Job::debug("trash")]);

        assert!(queue.has_trash());
        assert_eq!(names(&queue.take_trash()), vec!["debug"]);
        assert_eq!(names(&queue.take_pending()), vec!["nop"]);
        assert!(!queue.has_pending());
    }

    #[test]
    fn wait_idle_returns_once_drained() {
        let queue = std::sync::Arc::new(JobQueue::new(16));
        queue.enqueue(vec![Job::nop()]);

        let master = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut active = LinkedList::new();
                while queue.swap_active(&mut active, 0) {}
            })
        };

        queue.wait_idle();
        assert!(!queue.has_pending());
        master.join().unwrap();
    }
}
