use std::collections::VecDeque;

use super::{
    flow::{FlowJob, FreeFn},
    node::EngineNode,
    poll::{PollEntry, TimerEntry},
    probe::ProbeJob,
    Shared,
};

/// Resources the realtime thread is done with, on their way back to the
/// user thread.
pub(crate) enum Garbage {
    FlowJob(Box<FlowJob>),
    Timer(Box<TimerEntry>),
    Poll(Box<PollEntry>),
    ConstBlock(Box<[f32]>),
    Node(Box<EngineNode>),
    Probe(Box<ProbeJob>),
    UserCallback(FreeFn),
}

impl Garbage {
    /// Run the free callbacks of this resource and drop it.
    ///
    /// Must only be called from the user thread.
    pub fn release(self, shared: &Shared) {
        match self {
            Garbage::FlowJob(job) => job.release(),
            Garbage::Timer(timer) => timer.release(),
            Garbage::Poll(poll) => poll.release(),
            Garbage::ConstBlock(_) => {}
            Garbage::Node(node) => free_node(node, shared),
            Garbage::Probe(job) => job.release(),
            Garbage::UserCallback(func) => (func)(),
        }
    }
}

/// Call [`Module::free`](crate::Module::free), release any timed jobs and
/// probes the node still holds and give its id back.
pub(crate) fn free_node(mut node: Box<EngineNode>, shared: &Shared) {
    log::debug!("free node {:?}", node.id);

    if let Some(module) = node.module.as_mut() {
        module.free();
    }
    while let Some(job) = node.flow_jobs.pop_due(u64::MAX) {
        job.release();
    }
    while let Some(job) = node.boundary_jobs.pop_due(u64::MAX) {
        job.release();
    }
    while let Some(job) = node.probe_jobs.pop() {
        job.release();
    }

    shared.node_ids.lock().remove(node.id.0);
}

/// The realtime end of the garbage ring.
///
/// If the ring is full, garbage is parked in a preallocated overflow
/// queue and pushed again on the next flush.
pub(crate) struct GarbageSink {
    tx: rtrb::Producer<Garbage>,
    overflow: VecDeque<Garbage>,
}

impl GarbageSink {
    pub fn new(tx: rtrb::Producer<Garbage>, capacity: usize) -> Self {
        Self {
            tx,
            overflow: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, garbage: Garbage) {
        if !self.overflow.is_empty() {
            self.overflow.push_back(garbage);
            return;
        }

        if let Err(rtrb::PushError::Full(garbage)) = self.tx.push(garbage) {
            log::warn!("garbage ring is full, call garbage_collect() more often");
            self.overflow.push_back(garbage);
        }
    }

    /// Move parked garbage into the ring, as far as it fits.
    pub fn flush(&mut self) {
        while let Some(garbage) = self.overflow.pop_front() {
            if let Err(rtrb::PushError::Full(garbage)) = self.tx.push(garbage) {
                self.overflow.push_front(garbage);
                break;
            }
        }
    }

    /// Hand everything that does not fit into the ring to `release`.
    pub fn drain_overflow(&mut self, mut release: impl FnMut(Garbage)) {
        self.flush();
        for garbage in self.overflow.drain(..) {
            release(garbage);
        }
    }
}
