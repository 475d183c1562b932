use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use super::flow::FreeFn;

/// A file descriptor to watch, laid out like `struct pollfd`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

impl PollFd {
    pub fn new(fd: i32, events: i16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }
}

/// Checks whether the engine needs to process the next block.
///
/// Called with the block size, a timeout the function may lower, its
/// file descriptors, and whether their `revents` were filled in by the
/// embedder. Returns `true` if a block should be processed now.
pub type PollFn = Box<dyn FnMut(usize, &mut Option<Duration>, &mut [PollFd], bool) -> bool + Send>;

/// Called with the new tick stamp after every processed block. Returning
/// `false` removes the timer.
pub type TimerFn = Box<dyn FnMut(u64) -> bool + Send>;

/// Identifies a registered poll function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(u64);

impl PollId {
    pub(crate) fn next() -> Self {
        static NEXT_POLL_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_POLL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct PollEntry {
    pub id: PollId,
    pub func: PollFn,
    pub free: Option<FreeFn>,
    pub fds: Vec<PollFd>,
}

impl PollEntry {
    pub fn release(mut self: Box<Self>) {
        if let Some(free) = self.free.take() {
            (free)();
        }
    }
}

impl fmt::Debug for PollEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEntry")
            .field("id", &self.id)
            .field("fds", &self.fds)
            .finish_non_exhaustive()
    }
}

pub(crate) struct TimerEntry {
    pub func: TimerFn,
    pub free: Option<FreeFn>,
}

impl TimerEntry {
    pub fn release(mut self: Box<Self>) {
        if let Some(free) = self.free.take() {
            (free)();
        }
    }
}

/// The state exchanged between the master loop and the embedding
/// application's event loop.
///
/// After [`EngineMaster::prepare`](crate::EngineMaster::prepare) returned
/// `false`, the embedder should wait on `fds` for at most `timeout`
/// (`None` meaning no limit), fill in `revents`, set `revents_filled`, and
/// call [`EngineMaster::check`](crate::EngineMaster::check).
#[derive(Debug, Default, Clone)]
pub struct EngineLoop {
    pub timeout: Option<Duration>,
    pub fds: Vec<PollFd>,
    /// Set if `fds` differs from the set handed out by the previous
    /// prepare.
    pub fds_changed: bool,
    pub revents_filled: bool,
}

impl EngineLoop {
    pub fn with_capacity(max_poll_fds: usize) -> Self {
        Self {
            timeout: None,
            fds: Vec::with_capacity(max_poll_fds),
            fds_changed: false,
            revents_filled: false,
        }
    }
}
