pub mod config;
pub mod engine;
pub mod error;
pub mod module;
pub mod util;

pub use config::EngineConfig;
pub use engine::{
    engine_init, EngineLoop, Engine, EngineMaster, EngineNode, FlowJob, Job, MasterThread,
    ModuleHandle, NodeID, PollFd, PollId, Probe, Transaction,
};
pub use error::{EngineError, JobError, ScheduleError};
pub use module::{
    IStreamIdx, JStreamIdx, Module, ModuleClass, ModuleFlags, OStreamIdx, ProcessContext,
};

/// The maximum number of frames that can appear in a processing
/// block.
///
/// Every output buffer is allocated with the configured block size,
/// which must not exceed this value. The shared zero block is sized
/// to it as well.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Two sample values closer than this are considered equal.
pub const SIGNAL_EPSILON: f32 = 1.15e-14;

/// The number of processed blocks an unused const value block survives.
pub const CONST_VALUES_EXPIRE: u8 = 16;
