use std::fmt;

use crate::{
    error::JobError,
    module::{IStreamIdx, JStreamIdx, Module, OStreamIdx},
};

use super::{
    flow::{AccessFn, FlowJob, FreeFn},
    garbage::free_node,
    node::{EngineNode, ModuleHandle, NodeID},
    poll::{PollEntry, PollFd, PollFn, PollId, TimerEntry, TimerFn},
    probe::{Probe, ProbeJob},
    Engine, Shared,
};

/// One requested graph mutation.
///
/// Constructing a job validates its static preconditions but has no
/// effect on the engine. Jobs are added to a
/// [`Transaction`](crate::Transaction) and executed by the master loop,
/// in order, once the transaction is committed.
pub struct Job {
    pub(crate) kind: JobKind,
}

pub(crate) enum JobKind {
    Nop,
    Debug(String),
    Integrate(Option<Box<EngineNode>>),
    Discard {
        node: NodeID,
        /// Filled in by the master loop.
        discarded: Option<Box<EngineNode>>,
    },
    KillInputs(NodeID),
    KillOutputs(NodeID),
    Connect {
        src: NodeID,
        ostream: OStreamIdx,
        dest: NodeID,
        istream: IStreamIdx,
    },
    JointConnect {
        src: NodeID,
        ostream: OStreamIdx,
        dest: NodeID,
        jstream: JStreamIdx,
    },
    Disconnect {
        dest: NodeID,
        istream: IStreamIdx,
    },
    JointDisconnect {
        src: NodeID,
        ostream: OStreamIdx,
        dest: NodeID,
        jstream: JStreamIdx,
    },
    SetConsumer(NodeID),
    UnsetConsumer(NodeID),
    Suspend {
        node: NodeID,
        tick_stamp: u64,
    },
    ForceReset(NodeID),
    Access {
        node: NodeID,
        func: Option<AccessFn>,
        free: Option<FreeFn>,
    },
    AddFlowJob {
        node: NodeID,
        job: Option<Box<FlowJob>>,
    },
    AddBoundaryJob {
        node: NodeID,
        job: Option<Box<FlowJob>>,
    },
    ProbeRequest {
        node: NodeID,
        job: Option<Box<ProbeJob>>,
    },
    /// Does nothing in the master loop. The function runs during garbage
    /// collection.
    UserCallback(Option<FreeFn>),
    AddPoll(Option<Box<PollEntry>>),
    RemovePoll {
        id: PollId,
        /// Filled in by the master loop.
        removed: Option<Box<PollEntry>>,
    },
    AddTimer(Option<Box<TimerEntry>>),
}

impl Job {
    fn new(kind: JobKind) -> Self {
        Self { kind }
    }

    /// A job which does nothing.
    pub fn nop() -> Self {
        Self::new(JobKind::Nop)
    }

    /// Log `msg` from the realtime thread when the job runs.
    pub fn debug(msg: impl Into<String>) -> Self {
        Self::new(JobKind::Debug(msg.into()))
    }

    /// Add a node created with [`Engine::module_new`] to the graph.
    pub fn integrate(node: Box<EngineNode>) -> Self {
        Self::new(JobKind::Integrate(Some(node)))
    }

    /// Sever every connection of the node, remove it from the graph and
    /// hand it back to the user thread for garbage collection.
    pub fn discard(module: ModuleHandle) -> Self {
        Self::new(JobKind::Discard {
            node: module.id(),
            discarded: None,
        })
    }

    /// Disconnect every input and joint input stream of the node.
    pub fn kill_inputs(module: ModuleHandle) -> Self {
        Self::new(JobKind::KillInputs(module.id()))
    }

    /// Disconnect every stream that reads from the node.
    pub fn kill_outputs(module: ModuleHandle) -> Self {
        Self::new(JobKind::KillOutputs(module.id()))
    }

    /// Connect output stream `ostream` of `src` to input stream `istream`
    /// of `dest`.
    pub fn connect(
        src: ModuleHandle,
        ostream: impl Into<OStreamIdx>,
        dest: ModuleHandle,
        istream: impl Into<IStreamIdx>,
    ) -> Result<Self, JobError> {
        let ostream = src.ostream(ostream.into())?;
        let istream = dest.istream(istream.into())?;
        if src.id() == dest.id() {
            return Err(JobError::SelfConnection(src.id()));
        }

        Ok(Self::new(JobKind::Connect {
            src: src.id(),
            ostream,
            dest: dest.id(),
            istream,
        }))
    }

    /// Add a connection from output stream `ostream` of `src` to joint
    /// input stream `jstream` of `dest`.
    pub fn jconnect(
        src: ModuleHandle,
        ostream: impl Into<OStreamIdx>,
        dest: ModuleHandle,
        jstream: impl Into<JStreamIdx>,
    ) -> Result<Self, JobError> {
        let ostream = src.ostream(ostream.into())?;
        let jstream = dest.jstream(jstream.into())?;
        if src.id() == dest.id() {
            return Err(JobError::SelfConnection(src.id()));
        }

        Ok(Self::new(JobKind::JointConnect {
            src: src.id(),
            ostream,
            dest: dest.id(),
            jstream,
        }))
    }

    /// Disconnect input stream `istream` of `dest`.
    pub fn disconnect(
        dest: ModuleHandle,
        istream: impl Into<IStreamIdx>,
    ) -> Result<Self, JobError> {
        let istream = dest.istream(istream.into())?;

        Ok(Self::new(JobKind::Disconnect {
            dest: dest.id(),
            istream,
        }))
    }

    /// Remove the connection from output stream `ostream` of `src` to
    /// joint input stream `jstream` of `dest`.
    pub fn jdisconnect(
        src: ModuleHandle,
        ostream: impl Into<OStreamIdx>,
        dest: ModuleHandle,
        jstream: impl Into<JStreamIdx>,
    ) -> Result<Self, JobError> {
        let ostream = src.ostream(ostream.into())?;
        let jstream = dest.jstream(jstream.into())?;

        Ok(Self::new(JobKind::JointDisconnect {
            src: src.id(),
            ostream,
            dest: dest.id(),
            jstream,
        }))
    }

    /// Mark the node as a graph root. It is scheduled as long as nothing
    /// reads from it.
    pub fn set_consumer(module: ModuleHandle) -> Self {
        Self::new(JobKind::SetConsumer(module.id()))
    }

    pub fn unset_consumer(module: ModuleHandle) -> Self {
        Self::new(JobKind::UnsetConsumer(module.id()))
    }

    /// Suspend the node until a later [`Job::resume_at`].
    pub fn suspend_now(module: ModuleHandle) -> Self {
        Self::suspend_at(module, u64::MAX)
    }

    /// Keep the node suspended until `tick_stamp`.
    ///
    /// Only takes effect if it extends the current suspension.
    pub fn suspend_at(module: ModuleHandle, tick_stamp: u64) -> Self {
        Self::new(JobKind::Suspend {
            node: module.id(),
            tick_stamp,
        })
    }

    /// Resume the node once its counter reaches `tick_stamp`.
    pub fn resume_at(module: ModuleHandle, tick_stamp: u64) -> Result<Self, JobError> {
        if tick_stamp == u64::MAX {
            return Err(JobError::UnreachableStamp);
        }

        Ok(Self::new(JobKind::AddFlowJob {
            node: module.id(),
            job: Some(FlowJob::resume(tick_stamp)),
        }))
    }

    /// Reset the module before its next block.
    pub fn force_reset(module: ModuleHandle) -> Self {
        Self::new(JobKind::ForceReset(module.id()))
    }

    /// Run `func` on the realtime thread with mutable access to the
    /// module, as soon as the job is executed.
    ///
    /// `free` runs in the user thread during garbage collection, whether
    /// or not the job was executed.
    pub fn access(
        module: ModuleHandle,
        func: impl FnOnce(&mut dyn Module) + Send + 'static,
        free: Option<FreeFn>,
    ) -> Self {
        Self::new(JobKind::Access {
            node: module.id(),
            func: Some(Box::new(func)),
            free,
        })
    }

    /// Like [`Job::access`], but deferred until the node's counter reaches
    /// `tick_stamp`. This allows sample accurate parameter changes.
    pub fn flow_access(
        module: ModuleHandle,
        tick_stamp: u64,
        func: impl FnOnce(&mut dyn Module) + Send + 'static,
        free: Option<FreeFn>,
    ) -> Self {
        Self::new(JobKind::AddFlowJob {
            node: module.id(),
            job: Some(FlowJob::access(tick_stamp, Box::new(func), free)),
        })
    }

    /// Run `func` on the realtime thread at the block boundary before the
    /// node's counter passes `tick_stamp`.
    ///
    /// Boundary jobs run after every ordinary job of the dispatch, whether
    /// or not the node is scheduled.
    pub fn boundary_access(
        module: ModuleHandle,
        tick_stamp: u64,
        func: impl FnOnce(&mut dyn Module) + Send + 'static,
        free: Option<FreeFn>,
    ) -> Self {
        Self::new(JobKind::AddBoundaryJob {
            node: module.id(),
            job: Some(FlowJob::access(tick_stamp, Box::new(func), free)),
        })
    }

    /// Discard the node at the next block boundary.
    ///
    /// Unlike [`Job::discard`], jobs committed after this one may still
    /// refer to the node until the boundary is reached.
    pub fn boundary_discard(module: ModuleHandle) -> Self {
        Self::new(JobKind::AddBoundaryJob {
            node: module.id(),
            job: Some(FlowJob::discard(0)),
        })
    }

    /// Copy the output streams of the node at the end of the next
    /// processed block and hand them to `func` in the user thread.
    ///
    /// `func` runs during garbage collection. It runs with invalid streams
    /// if the node is discarded first.
    pub fn probe_request(
        engine: &Engine,
        module: ModuleHandle,
        func: impl FnOnce(Probe) + Send + 'static,
    ) -> Self {
        let probe = Probe::new(usize::from(module.class().n_ostreams), engine.block_size());

        Self::new(JobKind::ProbeRequest {
            node: module.id(),
            job: Some(ProbeJob::new(probe, Box::new(func))),
        })
    }

    pub(crate) fn user_callback(func: FreeFn) -> Self {
        Self::new(JobKind::UserCallback(Some(func)))
    }

    /// Register a function which decides when the master loop processes
    /// the next block.
    ///
    /// The returned [`PollId`] can be passed to [`Job::remove_poll`].
    pub fn add_poll(
        engine: &Engine,
        fds: Vec<PollFd>,
        func: impl FnMut(usize, &mut Option<std::time::Duration>, &mut [PollFd], bool) -> bool
            + Send
            + 'static,
        free: Option<FreeFn>,
    ) -> Result<(Self, PollId), JobError> {
        let max = engine.config().max_poll_fds;
        if fds.len() > max {
            return Err(JobError::TooManyPollFds {
                requested: fds.len(),
                max,
            });
        }

        let id = PollId::next();
        let func: PollFn = Box::new(func);
        let entry = Box::new(PollEntry { id, func, free, fds });

        Ok((Self::new(JobKind::AddPoll(Some(entry))), id))
    }

    pub fn remove_poll(id: PollId) -> Self {
        Self::new(JobKind::RemovePoll { id, removed: None })
    }

    /// Register a function that is called with the new tick stamp after
    /// every processed block, until it returns `false`.
    pub fn add_timer(
        func: impl FnMut(u64) -> bool + Send + 'static,
        free: Option<FreeFn>,
    ) -> Self {
        let func: TimerFn = Box::new(func);
        Self::new(JobKind::AddTimer(Some(Box::new(TimerEntry { func, free }))))
    }

    pub(crate) fn name(&self) -> &'static str {
        match &self.kind {
            JobKind::Nop => "nop",
            JobKind::Debug(_) => "debug",
            JobKind::Integrate(_) => "integrate",
            JobKind::Discard { .. } => "discard",
            JobKind::KillInputs(_) => "kill_inputs",
            JobKind::KillOutputs(_) => "kill_outputs",
            JobKind::Connect { .. } => "connect",
            JobKind::JointConnect { .. } => "jconnect",
            JobKind::Disconnect { .. } => "disconnect",
            JobKind::JointDisconnect { .. } => "jdisconnect",
            JobKind::SetConsumer(_) => "set_consumer",
            JobKind::UnsetConsumer(_) => "unset_consumer",
            JobKind::Suspend { .. } => "suspend",
            JobKind::ForceReset(_) => "force_reset",
            JobKind::Access { .. } => "access",
            JobKind::AddFlowJob { .. } => "add_flow_job",
            JobKind::AddBoundaryJob { .. } => "add_boundary_job",
            JobKind::ProbeRequest { .. } => "probe_request",
            JobKind::UserCallback(_) => "user_callback",
            JobKind::AddPoll(_) => "add_poll",
            JobKind::RemovePoll { .. } => "remove_poll",
            JobKind::AddTimer(_) => "add_timer",
        }
    }

    /// Run the free callbacks of whatever this job still owns and drop it.
    ///
    /// Must only be called from the user thread.
    pub(crate) fn release(self, shared: &Shared) {
        match self.kind {
            JobKind::Integrate(Some(node))
            | JobKind::Discard {
                discarded: Some(node),
                ..
            } => free_node(node, shared),
            JobKind::Access {
                free: Some(free), ..
            } => (free)(),
            JobKind::AddFlowJob { job: Some(job), .. }
            | JobKind::AddBoundaryJob { job: Some(job), .. } => job.release(),
            JobKind::ProbeRequest { job: Some(job), .. } => job.release(),
            JobKind::UserCallback(Some(func)) => (func)(),
            JobKind::AddPoll(Some(poll))
            | JobKind::RemovePoll {
                removed: Some(poll),
                ..
            } => poll.release(),
            JobKind::AddTimer(Some(timer)) => timer.release(),
            _ => {}
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Job").field(&self.name()).finish()
    }
}
