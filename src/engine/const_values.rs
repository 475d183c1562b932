use std::cmp::Ordering;

use crate::{util, CONST_VALUES_EXPIRE};

struct ConstBlock {
    value: f32,
    block: Box<[f32]>,
    /// Counts down once per processed block, reset on every hit.
    used: u8,
}

/// A cache of shared read-only blocks that each repeat a single value.
///
/// Entries are kept sorted by value and deduplicated with an epsilon
/// tolerance. Any value within epsilon of zero maps to the process-wide
/// zero block, which is never aged out.
pub struct ConstValueCache {
    entries: Vec<ConstBlock>,
    block_size: usize,
    epsilon: f32,
}

impl ConstValueCache {
    pub(crate) fn new(block_size: usize, epsilon: f32) -> Self {
        Self {
            entries: Vec::with_capacity(16),
            block_size,
            epsilon,
        }
    }

    fn is_zero(&self, value: f32) -> bool {
        value == 0.0 || value.abs() < self.epsilon
    }

    fn lookup(&self, value: f32) -> Result<usize, usize> {
        let epsilon = self.epsilon;
        self.entries.binary_search_by(|e| {
            let cmp = value - e.value;
            if cmp > epsilon {
                Ordering::Less
            } else if cmp < -epsilon {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
    }

    /// Get a block of `block_size` frames filled with `value`.
    pub fn get_const_block(&mut self, value: f32) -> &[f32] {
        if self.is_zero(value) {
            return util::const_zeros(self.block_size);
        }

        let i = match self.lookup(value) {
            Ok(i) => {
                self.entries[i].used = CONST_VALUES_EXPIRE;
                i
            }
            Err(i) => {
                let mut block = vec![0.0; self.block_size].into_boxed_slice();
                util::block_fill(&mut block, value);
                self.entries.insert(
                    i,
                    ConstBlock {
                        value,
                        block,
                        used: CONST_VALUES_EXPIRE,
                    },
                );
                i
            }
        };

        &self.entries[i].block
    }

    /// Age every entry by one block, handing expired blocks to `free`.
    pub(crate) fn recycle(&mut self, mut free: impl FnMut(Box<[f32]>)) {
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            entry.used = entry.used.saturating_sub(1);

            if entry.used == 0 {
                free(self.entries.remove(i).block);
            } else {
                i += 1;
            }
        }
    }

    /// Hand every block to `free`, regardless of age.
    pub(crate) fn clear(&mut self, mut free: impl FnMut(Box<[f32]>)) {
        for entry in self.entries.drain(..) {
            free(entry.block);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
