use std::{fmt, sync::Arc};

use parking_lot::ReentrantMutex;
use smallvec::SmallVec;

use crate::{
    error::JobError,
    module::{IStreamIdx, JStreamIdx, Module, ModuleClass, ModuleFlags, OStreamIdx},
};

use super::{flow::FlowJobList, probe::ProbeJobStack};

/// Node storage of the master loop, indexed by [`NodeID`].
pub(crate) type NodeArena = thunderdome::Arena<Box<EngineNode>>;

/// A globally unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeID(pub(crate) thunderdome::Index);

/// A cheap, copyable reference to a node, used to construct jobs.
///
/// It carries the stream layout of the module so that job constructors
/// can validate stream indices without touching the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle {
    id: NodeID,
    class: ModuleClass,
}

impl ModuleHandle {
    pub fn id(&self) -> NodeID {
        self.id
    }

    pub fn class(&self) -> ModuleClass {
        self.class
    }

    pub(crate) fn istream(&self, idx: IStreamIdx) -> Result<IStreamIdx, JobError> {
        if idx.0 >= self.class.n_istreams {
            return Err(JobError::IStreamOutOfRange {
                node: self.id,
                index: idx.0,
                num: self.class.n_istreams,
            });
        }
        Ok(idx)
    }

    pub(crate) fn jstream(&self, idx: JStreamIdx) -> Result<JStreamIdx, JobError> {
        if idx.0 >= self.class.n_jstreams {
            return Err(JobError::JStreamOutOfRange {
                node: self.id,
                index: idx.0,
                num: self.class.n_jstreams,
            });
        }
        Ok(idx)
    }

    pub(crate) fn ostream(&self, idx: OStreamIdx) -> Result<OStreamIdx, JobError> {
        if idx.0 >= self.class.n_ostreams {
            return Err(JobError::OStreamOutOfRange {
                node: self.id,
                index: idx.0,
                num: self.class.n_ostreams,
            });
        }
        Ok(idx)
    }
}

/// The source of a single input stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Input {
    pub src: Option<(NodeID, OStreamIdx)>,
}

/// One connection of a joint input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JInput {
    pub src_node: NodeID,
    pub src_stream: OStreamIdx,
}

/// An output stream and its preallocated buffer.
pub(crate) struct Output {
    pub buffer: Box<[f32]>,
    /// The number of live inputs (across all nodes) that read this output.
    pub n_outputs: u32,
    /// Whether a scheduled node reads this output. Maintained by the
    /// scheduler.
    pub connected: bool,
}

/// The graph-resident wrapper around one [`Module`] instance.
///
/// An `EngineNode` is created in the user thread by
/// [`Engine::module_new`](crate::Engine::module_new) and handed to the
/// engine with [`Job::integrate`](crate::Job::integrate). From then on it
/// is only touched by the realtime thread until it is discarded and
/// returned through garbage collection.
pub struct EngineNode {
    pub(crate) id: NodeID,
    pub(crate) class: ModuleClass,
    /// Taken out while the module is being processed.
    pub(crate) module: Option<Box<dyn Module>>,

    pub(crate) inputs: SmallVec<[Input; 4]>,
    pub(crate) jinputs: SmallVec<[Vec<JInput>; 2]>,
    pub(crate) outputs: Vec<Output>,
    /// One entry per connection that reads from this node.
    pub(crate) output_nodes: SmallVec<[NodeID; 4]>,

    pub(crate) integrated: bool,
    pub(crate) is_consumer: bool,
    pub(crate) needs_reset: bool,
    pub(crate) update_suspend: bool,
    pub(crate) in_suspend_call: bool,
    /// The node suspends itself until this stamp.
    pub(crate) local_active: u64,
    /// The node is suspended while its counter is below this stamp.
    pub(crate) next_active: u64,

    pub(crate) sched_tag: bool,
    pub(crate) sched_recurse_tag: bool,
    pub(crate) sched_leaf_level: u32,
    pub(crate) cleared_ostreams: bool,
    pub(crate) in_process: bool,

    /// The tick stamp up to which this node has been processed.
    pub(crate) counter: u64,
    pub(crate) flow_jobs: FlowJobList,
    /// Jobs run at the block boundary before the counter passes their
    /// stamp.
    pub(crate) boundary_jobs: FlowJobList,
    pub(crate) probe_jobs: ProbeJobStack,

    pub(crate) toplevel_next: Option<NodeID>,
    pub(crate) mnl_prev: Option<NodeID>,
    pub(crate) mnl_next: Option<NodeID>,

    /// Guards processing when several threads pop from the same schedule.
    pub(crate) lock: Arc<ReentrantMutex<()>>,
}

impl EngineNode {
    pub(crate) fn new(id: NodeID, module: Box<dyn Module>, block_size: usize) -> Self {
        let class = module.class();

        Self {
            id,
            class,
            module: Some(module),
            inputs: (0..class.n_istreams).map(|_| Input::default()).collect(),
            jinputs: (0..class.n_jstreams).map(|_| Vec::new()).collect(),
            outputs: (0..class.n_ostreams)
                .map(|_| Output {
                    buffer: vec![0.0; block_size].into_boxed_slice(),
                    n_outputs: 0,
                    connected: false,
                })
                .collect(),
            output_nodes: SmallVec::new(),
            integrated: false,
            is_consumer: false,
            needs_reset: true,
            update_suspend: true,
            in_suspend_call: false,
            local_active: 0,
            next_active: 0,
            sched_tag: false,
            sched_recurse_tag: false,
            sched_leaf_level: 0,
            cleared_ostreams: false,
            in_process: false,
            counter: 0,
            flow_jobs: FlowJobList::default(),
            boundary_jobs: FlowJobList::default(),
            probe_jobs: ProbeJobStack::default(),
            toplevel_next: None,
            mnl_prev: None,
            mnl_next: None,
            lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    pub fn handle(&self) -> ModuleHandle {
        ModuleHandle {
            id: self.id,
            class: self.class,
        }
    }

    pub fn id(&self) -> NodeID {
        self.id
    }

    pub fn class(&self) -> ModuleClass {
        self.class
    }

    pub fn module(&self) -> Option<&dyn Module> {
        self.module.as_deref()
    }

    pub fn module_mut(&mut self) -> Option<&mut (dyn Module + 'static)> {
        self.module.as_deref_mut()
    }

    /// The tick stamp up to which this node has been processed.
    pub fn tick_stamp(&self) -> u64 {
        self.counter
    }

    /// Whether the given input stream has a source.
    pub fn has_source(&self, istream: impl Into<IStreamIdx>) -> bool {
        self.inputs
            .get(usize::from(istream.into().0))
            .is_some_and(|i| i.src.is_some())
    }

    /// The number of live inputs that read from the given output stream.
    pub fn fan_out(&self, ostream: impl Into<OStreamIdx>) -> u32 {
        self.outputs
            .get(usize::from(ostream.into().0))
            .map_or(0, |o| o.n_outputs)
    }

    /// The number of live connections of a joint input stream.
    pub fn jstream_connections(&self, jstream: impl Into<JStreamIdx>) -> usize {
        self.jinputs
            .get(usize::from(jstream.into().0))
            .map_or(0, |j| j.len())
    }

    /// A consumer is a node marked as a graph root which nothing reads
    /// from.
    pub fn is_consumer(&self) -> bool {
        self.is_consumer && self.output_nodes.is_empty()
    }

    pub fn is_scheduled(&self) -> bool {
        self.sched_tag
    }

    pub fn leaf_level(&self) -> u32 {
        self.sched_leaf_level
    }

    pub(crate) fn is_suspended(&self, stamp: u64) -> bool {
        stamp < self.next_active
    }

    pub(crate) fn is_delay(&self) -> bool {
        self.class.flags.contains(ModuleFlags::DELAY)
    }

    pub(crate) fn is_expensive(&self) -> bool {
        self.class.flags.contains(ModuleFlags::EXPENSIVE)
    }
}

impl fmt::Debug for EngineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineNode")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("integrated", &self.integrated)
            .field("counter", &self.counter)
            .field("leaf_level", &self.sched_leaf_level)
            .field("flow_jobs", &self.flow_jobs.len())
            .field("boundary_jobs", &self.boundary_jobs.len())
            .finish_non_exhaustive()
    }
}
