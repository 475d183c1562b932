use std::fmt;

use crate::module::Module;

/// A callback run on the realtime thread with mutable access to a module.
pub type AccessFn = Box<dyn FnOnce(&mut dyn Module) + Send + 'static>;

/// A callback run in the user thread once the engine is done with the
/// data it cleans up.
pub type FreeFn = Box<dyn FnOnce() + Send + 'static>;

/// A job that is deferred until a node's tick counter reaches a stamp.
pub struct FlowJob {
    pub(crate) tick_stamp: u64,
    pub(crate) kind: FlowJobKind,
    pub(crate) next: Option<Box<FlowJob>>,
}

pub(crate) enum FlowJobKind {
    Access {
        func: Option<AccessFn>,
        free: Option<FreeFn>,
    },
    Resume,
    /// Only queued as a boundary job.
    Discard,
}

impl FlowJob {
    pub(crate) fn access(tick_stamp: u64, func: AccessFn, free: Option<FreeFn>) -> Box<Self> {
        Box::new(Self {
            tick_stamp,
            kind: FlowJobKind::Access {
                func: Some(func),
                free,
            },
            next: None,
        })
    }

    pub(crate) fn resume(tick_stamp: u64) -> Box<Self> {
        Box::new(Self {
            tick_stamp,
            kind: FlowJobKind::Resume,
            next: None,
        })
    }

    pub(crate) fn discard(tick_stamp: u64) -> Box<Self> {
        Box::new(Self {
            tick_stamp,
            kind: FlowJobKind::Discard,
            next: None,
        })
    }

    /// The tick stamp at which this job becomes due.
    pub fn tick_stamp(&self) -> u64 {
        self.tick_stamp
    }

    pub fn is_resume(&self) -> bool {
        matches!(self.kind, FlowJobKind::Resume)
    }

    /// Run the free function in the user thread and drop the job.
    pub(crate) fn release(mut self: Box<Self>) {
        debug_assert!(self.next.is_none());

        if let FlowJobKind::Access { free, .. } = &mut self.kind {
            if let Some(free) = free.take() {
                (free)();
            }
        }
    }
}

impl fmt::Debug for FlowJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowJob")
            .field("tick_stamp", &self.tick_stamp)
            .field("resume", &self.is_resume())
            .finish()
    }
}

/// The per-node list of pending flow jobs, ordered by tick stamp.
///
/// Jobs with equal stamps keep their insertion order. The list is
/// intrusive so that neither insertion nor removal allocates on the
/// realtime thread.
#[derive(Default)]
pub(crate) struct FlowJobList {
    head: Option<Box<FlowJob>>,
}

impl FlowJobList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn insert(&mut self, mut job: Box<FlowJob>) {
        debug_assert!(job.next.is_none());

        let mut cursor = &mut self.head;
        while cursor
            .as_ref()
            .is_some_and(|j| j.tick_stamp <= job.tick_stamp)
        {
            if let Some(j) = cursor {
                cursor = &mut j.next;
            }
        }

        job.next = cursor.take();
        *cursor = Some(job);
    }

    /// The stamp of the earliest pending job, or `u64::MAX` if there is
    /// none.
    pub fn peek_stamp(&self) -> u64 {
        self.head.as_ref().map_or(u64::MAX, |j| j.tick_stamp)
    }

    /// Remove the earliest job if it is due at `tick_stamp`.
    pub fn pop_due(&mut self, tick_stamp: u64) -> Option<Box<FlowJob>> {
        if self.peek_stamp() > tick_stamp {
            return None;
        }

        let mut job = self.head.take()?;
        self.head = job.next.take();
        Some(job)
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = &self.head;
        while let Some(j) = cursor {
            n += 1;
            cursor = &j.next;
        }
        n
    }
}

impl Drop for FlowJobList {
    fn drop(&mut self) {
        // Unlink iteratively so long lists cannot overflow the stack.
        let mut cursor = self.head.take();
        while let Some(mut j) = cursor {
            cursor = j.next.take();
        }
    }
}
