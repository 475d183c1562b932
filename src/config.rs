use crate::{error::EngineError, MAX_BLOCK_SIZE, SIGNAL_EPSILON};

/// Static configuration of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// The number of frames processed per block. Every module output
    /// buffer is allocated with this length.
    pub block_size: usize,
    /// The sample rate in Hz.
    pub sample_freq: u32,
    /// Mask applied to frame offsets to obtain the control raster
    /// (`control_raster = sub_sample_mask + 1`).
    pub sub_sample_mask: u32,
    /// Initial capacity of the node arena. Integrating more nodes than
    /// this allocates on the realtime thread.
    pub node_capacity: usize,
    /// Maximum number of poll file descriptors registered at once.
    ///
    /// Exceeding this is fatal.
    pub max_poll_fds: usize,
    /// Capacity of the ring that hands garbage back to the user thread.
    pub garbage_capacity: usize,
    /// Tolerance used to deduplicate const value blocks.
    pub const_value_epsilon: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 128,
            sample_freq: 48_000,
            sub_sample_mask: 15,
            node_capacity: 256,
            max_poll_fds: 128,
            garbage_capacity: 1024,
            const_value_epsilon: SIGNAL_EPSILON,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.block_size < 16 || self.block_size > MAX_BLOCK_SIZE || self.block_size % 16 != 0 {
            return Err(EngineError::InvalidBlockSize(self.block_size));
        }
        if self.sample_freq == 0 {
            return Err(EngineError::InvalidSampleFreq);
        }

        let raster = self.sub_sample_mask as usize + 1;
        if !raster.is_power_of_two() || raster > self.block_size {
            return Err(EngineError::InvalidSubSampleMask {
                mask: self.sub_sample_mask,
                block_size: self.block_size,
            });
        }

        if self.node_capacity == 0 {
            return Err(EngineError::ZeroCapacity("node_capacity"));
        }
        if self.garbage_capacity == 0 {
            return Err(EngineError::ZeroCapacity("garbage_capacity"));
        }
        if !(self.const_value_epsilon >= 0.0) {
            return Err(EngineError::InvalidEpsilon(self.const_value_epsilon));
        }

        Ok(())
    }

    /// The number of frames between two control value updates.
    pub fn control_raster(&self) -> usize {
        self.sub_sample_mask as usize + 1
    }
}
