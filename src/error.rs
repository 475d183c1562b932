use std::fmt;

use crate::engine::NodeID;

/// An error occurred while creating an engine instance.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("block size {0} must be a multiple of 16 between 16 and {max}", max = crate::MAX_BLOCK_SIZE)]
    InvalidBlockSize(usize),
    #[error("sample frequency must be greater than zero")]
    InvalidSampleFreq,
    #[error("sub sample mask {mask} does not describe a power-of-two control raster within block size {block_size}")]
    InvalidSubSampleMask { mask: u32, block_size: usize },
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
    #[error("const value epsilon {0} must be a non-negative number")]
    InvalidEpsilon(f32),
}

/// An error occurred while constructing a [`Job`](crate::Job).
///
/// If this is returned, then no job was created and the engine has
/// not been touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("input stream {index} is out of range for node {node:?} with {num} input streams")]
    IStreamOutOfRange { node: NodeID, index: u16, num: u16 },
    #[error("joint stream {index} is out of range for node {node:?} with {num} joint streams")]
    JStreamOutOfRange { node: NodeID, index: u16, num: u16 },
    #[error("output stream {index} is out of range for node {node:?} with {num} output streams")]
    OStreamOutOfRange { node: NodeID, index: u16, num: u16 },
    #[error("cannot connect node {0:?} to itself")]
    SelfConnection(NodeID),
    #[error("a tick stamp of u64::MAX can never be reached")]
    UnreachableStamp,
    #[error("poll function requests {requested} file descriptors, but the engine allows at most {max}")]
    TooManyPollFds { requested: usize, max: usize },
}

/// An error occurred while building a schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Every member of this cycle needs the current block of its
    /// upstream members before it can produce output.
    #[error("cycle without delay module: {nodes:?}")]
    CycleWithoutDelay { nodes: Vec<NodeID> },
}

/// Log the message and abort the process.
///
/// Used where continuing would corrupt shared bookkeeping.
#[cold]
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("{args}");
    std::process::abort()
}
