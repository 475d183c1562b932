use std::collections::VecDeque;

use smallvec::SmallVec;

use super::node::NodeID;

/// A set of mutually dependent nodes that share one leaf level.
pub(crate) type CycleNodes = SmallVec<[NodeID; 4]>;

#[derive(Default)]
struct LeafLevel {
    nodes: VecDeque<NodeID>,
    cycles: Vec<CycleNodes>,
}

/// Refers to a cycle handed out by [`Schedule::pop_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleRef {
    level: usize,
    index: usize,
}

/// A topological ordering of nodes into leaf levels.
///
/// Nodes in leaf level `n` only depend on nodes in levels below `n`,
/// except for the members of a cycle which share a level. While
/// secured the schedule is frozen and can be popped from, level by
/// level. It has to be unsecured before it can be changed again.
pub(crate) struct Schedule {
    levels: Vec<LeafLevel>,
    n_items: usize,
    secured: bool,

    cur_level: usize,
    cur_node: usize,
    cur_cycle: usize,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            levels: Vec::new(),
            n_items: 0,
            secured: false,
            cur_level: usize::MAX,
            cur_node: 0,
            cur_cycle: 0,
        }
    }

    /// The number of scheduled nodes and cycles.
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Grow with power of two alignment so that `leaf_level` fits.
    fn grow(&mut self, leaf_level: usize) {
        let needed = crate::util::upper_power2(leaf_level + 1, 1);
        if self.levels.len() < needed {
            self.levels.resize_with(needed, LeafLevel::default);
        }
    }

    pub fn push_node(&mut self, id: NodeID, leaf_level: u32, expensive: bool) {
        if self.secured {
            log::warn!("cannot schedule node {id:?} on a secured schedule");
            return;
        }

        let leaf_level = leaf_level as usize;
        self.grow(leaf_level);

        // Expensive nodes are processed first to better overlap with
        // cheaper work.
        if expensive {
            self.levels[leaf_level].nodes.push_front(id);
        } else {
            self.levels[leaf_level].nodes.push_back(id);
        }
        self.n_items += 1;
    }

    pub fn push_cycle(&mut self, nodes: CycleNodes, leaf_level: u32) {
        if self.secured {
            log::warn!("cannot schedule cycle {nodes:?} on a secured schedule");
            return;
        }

        let leaf_level = leaf_level as usize;
        self.grow(leaf_level);
        self.levels[leaf_level].cycles.push(nodes);
        self.n_items += 1;
    }

    /// Remove every node and cycle, calling `unschedule` for each node.
    ///
    /// Allocations are kept for the next build.
    pub fn clear(&mut self, mut unschedule: impl FnMut(NodeID)) {
        if self.secured {
            log::warn!("cannot clear a secured schedule");
            return;
        }

        for level in self.levels.iter_mut() {
            for id in level.nodes.drain(..) {
                unschedule(id);
            }
            for cycle in level.cycles.drain(..) {
                for id in cycle {
                    unschedule(id);
                }
            }
        }
        self.n_items = 0;
    }

    /// Freeze the schedule. It must be restarted before the first pop.
    pub fn secure(&mut self) {
        if self.secured {
            log::warn!("schedule is already secured");
            return;
        }

        self.secured = true;
        self.cur_level = self.levels.len();
        self.cur_node = 0;
        self.cur_cycle = 0;

        if log::log_enabled!(log::Level::Trace) {
            self.dump();
        }
    }

    /// Unfreeze the schedule so it can be cleared and rebuilt.
    pub fn unsecure(&mut self) {
        if !self.secured {
            log::warn!("schedule is not secured");
            return;
        }
        if self.cur_level < self.levels.len() {
            log::warn!("unsecuring a schedule which has not been fully popped");
        }

        self.secured = false;
        self.cur_level = usize::MAX;
    }

    /// Start handing out nodes from the lowest leaf level again.
    pub fn restart(&mut self) {
        if !self.secured {
            log::warn!("cannot restart an unsecured schedule");
            return;
        }
        if self.cur_level < self.levels.len() {
            log::warn!("restarting a schedule which has not been fully popped");
        }

        self.cur_level = 0;
        self.cur_node = 0;
        self.cur_cycle = 0;
    }

    fn advance(&mut self) {
        let level = &self.levels[self.cur_level];
        if self.cur_node >= level.nodes.len() && self.cur_cycle >= level.cycles.len() {
            self.cur_level += 1;
            self.cur_node = 0;
            self.cur_cycle = 0;
        }
    }

    /// Pop the next node of the current leaf level.
    ///
    /// Returns `None` once the schedule is exhausted, or if the current
    /// level still has cycles pending. Those have to be popped with
    /// [`Schedule::pop_cycle`] before this advances to the next level.
    pub fn pop_node(&mut self) -> Option<NodeID> {
        if !self.secured {
            log::warn!("cannot pop from an unsecured schedule");
            return None;
        }

        while self.cur_level < self.levels.len() {
            let level = &self.levels[self.cur_level];
            if let Some(&id) = level.nodes.get(self.cur_node) {
                self.cur_node += 1;
                return Some(id);
            }
            if self.cur_cycle < level.cycles.len() {
                return None;
            }
            self.advance();
        }

        None
    }

    /// Pop the next cycle of the current leaf level.
    ///
    /// Returns `None` once the schedule is exhausted, or if the current
    /// level still has single nodes pending.
    pub fn pop_cycle(&mut self) -> Option<CycleRef> {
        if !self.secured {
            log::warn!("cannot pop from an unsecured schedule");
            return None;
        }

        while self.cur_level < self.levels.len() {
            let level = &self.levels[self.cur_level];
            if self.cur_cycle < level.cycles.len() {
                let cycle = CycleRef {
                    level: self.cur_level,
                    index: self.cur_cycle,
                };
                self.cur_cycle += 1;
                return Some(cycle);
            }
            if self.cur_node < level.nodes.len() {
                return None;
            }
            self.advance();
        }

        None
    }

    pub fn cycle(&self, cycle: CycleRef) -> &[NodeID] {
        self.levels
            .get(cycle.level)
            .and_then(|l| l.cycles.get(cycle.index))
            .map_or(&[], |c| c.as_slice())
    }

    /// Whether every node and cycle has been handed out since the last
    /// restart.
    pub fn is_exhausted(&self) -> bool {
        self.cur_level >= self.levels.len()
    }

    fn dump(&self) {
        log::trace!(
            "schedule = {{ n_items: {}, leaf_levels: {}, secured: {} }}",
            self.n_items,
            self.levels.len(),
            self.secured
        );
        for (i, level) in self.levels.iter().enumerate() {
            if level.nodes.is_empty() && level.cycles.is_empty() {
                continue;
            }
            log::trace!(
                "  leaf_level {i}: nodes {:?}, cycles {:?}",
                level.nodes,
                level.cycles
            );
        }
    }
}
