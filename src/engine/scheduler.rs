use smallvec::SmallVec;

use crate::error::ScheduleError;

use super::{
    node::{NodeArena, NodeID},
    node_list::MasterNodeList,
    schedule::{CycleNodes, Schedule},
};

/// A dependency cycle found during a query which is not closed yet.
#[derive(Debug)]
struct Cycle {
    /// The node on the query stack the cycle leads back to.
    last: NodeID,
    nodes: CycleNodes,
    seen_delay: bool,
}

/// The result of querying the dependencies of one node.
#[derive(Debug, Default)]
struct Query {
    leaf_level: u32,
    /// Cycles leading to nodes further up the query stack.
    cycles: SmallVec<[Cycle; 2]>,
    /// Members of cycles which are closed, but are part of a node that
    /// cannot be scheduled yet.
    cycle_nodes: CycleNodes,
}

impl Query {
    fn add_cycle(&mut self, dep: NodeID, node: NodeID, node_is_delay: bool) {
        let mut nodes = CycleNodes::new();
        nodes.push(node);

        // `dep` is checked once the recursion returns to it.
        self.cycles.push(Cycle {
            last: dep,
            nodes,
            seen_delay: node_is_delay,
        });
    }

    fn merge_cycles(
        &mut self,
        mut child: Query,
        node: NodeID,
        node_is_delay: bool,
    ) -> Result<(), ScheduleError> {
        for cycle in child.cycles.iter_mut() {
            cycle.nodes.push(node);
            cycle.seen_delay |= node_is_delay;
        }
        self.cycles.extend(child.cycles.drain(..));
        merge_uniq(&mut self.cycle_nodes, child.cycle_nodes);

        self.resolve_cycles(node)
    }

    /// Close every cycle that leads back to `node`.
    fn resolve_cycles(&mut self, node: NodeID) -> Result<(), ScheduleError> {
        let mut i = 0;
        while i < self.cycles.len() {
            if self.cycles[i].last != node {
                i += 1;
                continue;
            }

            let cycle = self.cycles.swap_remove(i);
            if !cycle.seen_delay {
                return Err(ScheduleError::CycleWithoutDelay {
                    nodes: cycle.nodes.to_vec(),
                });
            }
            merge_uniq(&mut self.cycle_nodes, cycle.nodes);
        }

        Ok(())
    }
}

fn merge_uniq(into: &mut CycleNodes, from: CycleNodes) {
    for id in from {
        if !into.contains(&id) {
            into.push(id);
        }
    }
}

/// Builds a [`Schedule`] by walking the graph upstream from consumer
/// nodes.
///
/// Nodes with pending flow jobs are moved within the [`MasterNodeList`] as
/// they get scheduled, so that the list head only ever holds unscheduled
/// ones.
pub(crate) struct Scheduler<'a> {
    schedule: &'a mut Schedule,
    nodes: &'a mut NodeArena,
    mnl: &'a mut MasterNodeList,
    tick_stamp: u64,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        schedule: &'a mut Schedule,
        nodes: &'a mut NodeArena,
        mnl: &'a mut MasterNodeList,
        tick_stamp: u64,
    ) -> Self {
        Self {
            schedule,
            nodes,
            mnl,
            tick_stamp,
        }
    }

    /// Schedule a consumer and everything it depends on.
    pub fn schedule_consumer(&mut self, id: NodeID) -> Result<(), ScheduleError> {
        let node = &self.nodes[id.0];
        if !node.is_consumer() {
            log::warn!("node {id:?} is not a consumer");
            return Ok(());
        }
        if node.sched_tag {
            return Ok(());
        }

        let mut query = Query::default();
        self.query_node(id, &mut query)?;

        // Consumers have no outputs, so they cannot close a cycle.
        debug_assert!(query.cycles.is_empty());
        self.schedule_query(id, query);

        Ok(())
    }

    fn schedule_query(&mut self, id: NodeID, query: Query) {
        if query.cycle_nodes.is_empty() {
            self.schedule_node(id, query.leaf_level);
        } else {
            self.schedule_cycle(query.cycle_nodes, query.leaf_level);
        }
    }

    fn schedule_node(&mut self, id: NodeID, leaf_level: u32) {
        let node = &mut self.nodes[id.0];
        debug_assert!(!node.sched_tag);

        node.sched_tag = true;
        node.sched_leaf_level = leaf_level;
        self.schedule.push_node(id, leaf_level, node.is_expensive());

        if !node.flow_jobs.is_empty() {
            self.mnl.node_changed(self.nodes, id);
        }
    }

    fn schedule_cycle(&mut self, nodes: CycleNodes, leaf_level: u32) {
        for &id in nodes.iter() {
            let node = &mut self.nodes[id.0];
            node.sched_tag = true;
            node.sched_leaf_level = leaf_level;

            if !node.flow_jobs.is_empty() {
                self.mnl.node_changed(self.nodes, id);
            }
        }
        self.schedule.push_cycle(nodes, leaf_level);
    }

    fn query_node(&mut self, id: NodeID, query: &mut Query) -> Result<(), ScheduleError> {
        {
            let node = &mut self.nodes[id.0];
            debug_assert!(!node.sched_recurse_tag);
            node.sched_recurse_tag = true;

            if !node.cleared_ostreams {
                for output in node.outputs.iter_mut() {
                    output.connected = false;
                }
                node.cleared_ostreams = true;
            }
        }

        update_suspension_state(self.nodes, id);

        for i in 0..self.nodes[id.0].inputs.len() {
            if let Some((src, ostream)) = self.nodes[id.0].inputs[i].src {
                self.query_child(id, query, src, usize::from(ostream.0))?;
            }
        }
        for j in 0..self.nodes[id.0].jinputs.len() {
            for c in 0..self.nodes[id.0].jinputs[j].len() {
                let input = self.nodes[id.0].jinputs[j][c];
                self.query_child(id, query, input.src_node, usize::from(input.src_stream.0))?;
            }
        }

        let node = &mut self.nodes[id.0];
        node.counter = node.counter.max(self.tick_stamp);
        node.sched_recurse_tag = false;

        Ok(())
    }

    fn query_child(
        &mut self,
        id: NodeID,
        query: &mut Query,
        child: NodeID,
        ostream: usize,
    ) -> Result<(), ScheduleError> {
        let child_node = &self.nodes[child.0];

        if child_node.sched_tag {
            query.leaf_level = query.leaf_level.max(child_node.sched_leaf_level + 1);
        } else if child_node.sched_recurse_tag {
            let is_delay = self.nodes[id.0].is_delay();
            query.add_cycle(child, id, is_delay);
        } else {
            let mut child_query = Query::default();
            self.query_node(child, &mut child_query)?;
            query.leaf_level = query.leaf_level.max(child_query.leaf_level + 1);

            if child_query.cycles.is_empty() {
                self.schedule_query(child, child_query);
            } else {
                let is_delay = self.nodes[id.0].is_delay();
                query.merge_cycles(child_query, id, is_delay)?;
            }
        }

        if let Some(output) = self.nodes[child.0].outputs.get_mut(ostream) {
            output.connected = true;
        }

        Ok(())
    }
}

/// Take a node out of the schedule.
pub(crate) fn unschedule_node(nodes: &mut NodeArena, id: NodeID) {
    if let Some(node) = nodes.get_mut(id.0) {
        node.sched_tag = false;
        node.sched_leaf_level = 0;
        node.cleared_ostreams = false;
    }
}

/// Flag the node and everything upstream of it for a suspension state
/// update.
pub(crate) fn propagate_update_suspend(nodes: &mut NodeArena, id: NodeID) {
    let node = &mut nodes[id.0];
    if node.update_suspend {
        return;
    }
    node.update_suspend = true;

    for i in 0..nodes[id.0].inputs.len() {
        if let Some((src, _)) = nodes[id.0].inputs[i].src {
            propagate_update_suspend(nodes, src);
        }
    }
    for j in 0..nodes[id.0].jinputs.len() {
        for c in 0..nodes[id.0].jinputs[j].len() {
            let src = nodes[id.0].jinputs[j][c].src_node;
            propagate_update_suspend(nodes, src);
        }
    }
}

/// Compute the stamp until which a node is suspended.
///
/// A node is active as soon as any node reading from it is active, but
/// never before its own `local_active`. Consumers are always active.
fn determine_suspension_state(nodes: &mut NodeArena, id: NodeID, seen_cycle: &mut bool) -> u64 {
    if !nodes[id.0].update_suspend {
        return nodes[id.0].next_active;
    }

    nodes[id.0].in_suspend_call = true;

    let mut local_cycle = false;
    let mut stamp = if nodes[id.0].is_consumer() {
        0
    } else {
        let mut stamp = u64::MAX;
        for k in 0..nodes[id.0].output_nodes.len() {
            let dest = nodes[id.0].output_nodes[k];
            if nodes[dest.0].in_suspend_call {
                local_cycle = true;
            } else {
                stamp = stamp.min(determine_suspension_state(nodes, dest, &mut local_cycle));
            }
        }
        stamp
    };

    let node = &mut nodes[id.0];
    stamp = stamp.max(node.local_active);

    // Results computed inside a cycle depend on the entry point.
    if !local_cycle {
        node.next_active = stamp;
        node.update_suspend = false;
    }
    node.in_suspend_call = false;
    *seen_cycle |= local_cycle;

    stamp
}

/// Bring the suspension state of a node up to date.
///
/// The node is flagged for a reset whenever its suspension state changes.
pub(crate) fn update_suspension_state(nodes: &mut NodeArena, id: NodeID) {
    let previous = nodes[id.0].next_active;
    let mut seen_cycle = false;
    let stamp = determine_suspension_state(nodes, id, &mut seen_cycle);

    let node = &mut nodes[id.0];
    node.next_active = stamp;
    node.update_suspend = false;
    if stamp != previous {
        node.needs_reset = true;
    }
}
