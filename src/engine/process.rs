use std::{mem, sync::Arc};

use crate::{
    module::{IStream, ProcessContext},
    util::{self, recycle_vec},
};

use super::{
    flow::FlowJobKind,
    garbage::Garbage,
    master::EngineMaster,
    node::NodeID,
    node_list::unscheduled_with_flow_jobs,
    scheduler::{propagate_update_suspend, update_suspension_state},
};

impl EngineMaster {
    /// Process one block of the secured schedule, then advance the tick
    /// stamp.
    pub(super) fn process_flow(&mut self) {
        self.need_process = false;

        if !self.schedule.is_secured() {
            log::warn!("process_flow: schedule is not secured");
            return;
        }

        let final_counter = self.tick_stamp + self.config.block_size as u64;

        self.schedule.restart();
        loop {
            if let Some(id) = self.schedule.pop_node() {
                self.process_locked_node(id, final_counter);
            } else if let Some(cycle) = self.schedule.pop_cycle() {
                for k in 0..self.schedule.cycle(cycle).len() {
                    let id = self.schedule.cycle(cycle)[k];
                    self.process_locked_node(id, final_counter);
                }
            } else {
                break;
            }
        }
        debug_assert!(self.schedule.is_exhausted());

        // Unscheduled nodes still need their flow jobs run.
        let mut cursor = self.mnl.head_needs_visit(&self.nodes);
        while let Some(id) = cursor {
            cursor = self.nodes[id.0]
                .mnl_next
                .filter(|&next| unscheduled_with_flow_jobs(&self.nodes, next));

            self.nodes[id.0].counter = final_counter;
            self.update_node_state(id, final_counter - 1);
            self.mnl.node_changed(&mut self.nodes, id);
        }

        if !self.probe_nodes.is_empty() {
            self.take_probes();
        }

        self.advance_tick();

        let garbage = &mut self.garbage;
        self.const_values
            .recycle(|block| garbage.push(Garbage::ConstBlock(block)));
    }

    /// Bring a scheduled node up to `final_counter`, processing its inputs
    /// first.
    ///
    /// The block is split at every pending flow job and at the stamp at
    /// which the node leaves suspension.
    fn process_locked_node(&mut self, id: NodeID, final_counter: u64) {
        let Some(node) = self.nodes.get(id.0) else {
            log::warn!("process: node {id:?} is not integrated");
            return;
        };
        if !node.integrated || !node.sched_tag {
            log::warn!("process: node {id:?} is not scheduled");
            return;
        }

        let lock = Arc::clone(&node.lock);
        let _guard = lock.lock();

        let tick_stamp = self.tick_stamp;
        let node = &mut self.nodes[id.0];
        node.in_process = true;
        node.counter = node.counter.max(tick_stamp);

        while self.nodes[id.0].counter < final_counter {
            let counter = self.nodes[id.0].counter;
            self.update_node_state(id, counter);

            let node = &self.nodes[id.0];
            let mut new_counter = final_counter.min(node.flow_jobs.peek_stamp());
            if node.next_active > counter {
                new_counter = new_counter.min(node.next_active);
            }

            for i in 0..self.nodes[id.0].inputs.len() {
                if let Some((src, _)) = self.nodes[id.0].inputs[i].src {
                    self.process_input(src, final_counter);
                }
            }
            for j in 0..self.nodes[id.0].jinputs.len() {
                for c in 0..self.nodes[id.0].jinputs[j].len() {
                    let src = self.nodes[id.0].jinputs[j][c].src_node;
                    self.process_input(src, final_counter);
                }
            }

            self.run_module(id, counter, new_counter);
            self.nodes[id.0].counter = new_counter;
        }

        self.nodes[id.0].in_process = false;
    }

    fn process_input(&mut self, src: NodeID, final_counter: u64) {
        let node = &self.nodes[src.0];
        // Members of a cycle read whatever the node produced so far.
        if node.in_process || node.counter >= final_counter {
            return;
        }
        self.process_locked_node(src, final_counter);
    }

    /// Call [`Module::process`](crate::Module::process) for the frames
    /// between `counter` and `new_counter`.
    fn run_module(&mut self, id: NodeID, counter: u64, new_counter: u64) {
        let diff = (counter - self.tick_stamp) as usize;
        let n_values = (new_counter - counter) as usize;

        let node = &mut self.nodes[id.0];
        let Some(mut module) = node.module.take() else {
            return;
        };
        let mut outputs = mem::take(&mut node.outputs);

        if node.is_suspended(counter) {
            for output in outputs.iter_mut() {
                util::block_fill(&mut output.buffer[diff..diff + n_values], 0.0);
            }
            node.needs_reset = true;
        } else {
            let nodes = &self.nodes;
            let node = &nodes[id.0];

            let mut istreams: Vec<IStream<'_>> = recycle_vec(mem::take(&mut self.scratch.istreams));
            let mut jvalues: Vec<&[f32]> = recycle_vec(mem::take(&mut self.scratch.jvalues));
            let mut jranges = mem::take(&mut self.scratch.jranges);
            jranges.clear();

            let range = diff..diff + n_values;

            for input in node.inputs.iter() {
                istreams.push(match input.src {
                    Some((src, ostream)) => IStream {
                        values: &nodes[src.0].outputs[usize::from(ostream.0)].buffer
                            [range.clone()],
                        connected: true,
                    },
                    None => IStream {
                        values: util::const_zeros(n_values),
                        connected: false,
                    },
                });
            }
            for jinputs in node.jinputs.iter() {
                let start = jvalues.len();
                for jinput in jinputs.iter() {
                    let src = &nodes[jinput.src_node.0];
                    jvalues.push(&src.outputs[usize::from(jinput.src_stream.0)].buffer[range.clone()]);
                }
                jranges.push(start..jvalues.len());
            }

            let mut cx = ProcessContext {
                istreams: &istreams,
                jvalues: &jvalues,
                jranges: &jranges,
                outputs: &mut outputs,
                offset: diff,
                n_values,
                tick_stamp: counter,
                const_values: &mut self.const_values,
            };
            module.process(&mut cx, n_values);

            self.scratch.istreams = recycle_vec(istreams);
            self.scratch.jvalues = recycle_vec(jvalues);
            self.scratch.jranges = jranges;
        }

        let node = &mut self.nodes[id.0];
        node.module = Some(module);
        node.outputs = outputs;
    }

    /// Reset the module if needed and run every flow job due at `stamp`.
    fn update_node_state(&mut self, id: NodeID, stamp: u64) {
        self.maybe_reset(id);

        while let Some(mut job) = self.nodes[id.0].flow_jobs.pop_due(stamp) {
            log::trace!(
                "flow job for {id:?} at {} (counter {})",
                job.tick_stamp,
                self.nodes[id.0].counter
            );

            match &mut job.kind {
                FlowJobKind::Access { func, .. } => {
                    if let (Some(func), Some(module)) =
                        (func.take(), self.nodes[id.0].module.as_deref_mut())
                    {
                        (func)(module);
                    }
                }
                FlowJobKind::Resume => self.resume_node(id, job.tick_stamp),
                FlowJobKind::Discard => {
                    log::warn!("flow job for {id:?}: discard is only run at block boundaries");
                }
            }

            self.garbage.push(Garbage::FlowJob(job));
        }

        self.maybe_reset(id);
    }

    /// Serve one pending probe request of every probed node with the block
    /// that was just processed.
    fn take_probes(&mut self) {
        let tick_stamp = self.tick_stamp;

        let mut i = 0;
        while i < self.probe_nodes.len() {
            let id = self.probe_nodes[i];
            let node = &mut self.nodes[id.0];

            if let Some(mut job) = node.probe_jobs.pop() {
                if node.sched_tag {
                    let outputs = node.outputs.iter().map(|o| (&*o.buffer, o.connected));
                    job.probe.fill(tick_stamp, outputs);
                } else {
                    job.probe.mark_taken(tick_stamp);
                }
                self.garbage.push(Garbage::Probe(job));
            }

            if self.nodes[id.0].probe_jobs.is_empty() {
                self.probe_nodes.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn maybe_reset(&mut self, id: NodeID) {
        let node = &mut self.nodes[id.0];
        if node.needs_reset && !node.is_suspended(node.counter) {
            if let Some(module) = node.module.as_deref_mut() {
                module.reset();
            }
            node.needs_reset = false;
        }
    }

    pub(super) fn resume_node(&mut self, id: NodeID, stamp: u64) {
        log::debug!("resume({id:?},{stamp})");

        let node = &mut self.nodes[id.0];
        if node.local_active == stamp {
            return;
        }
        node.local_active = stamp;
        node.needs_reset = true;

        propagate_update_suspend(&mut self.nodes, id);
        if self.nodes[id.0].sched_tag {
            update_suspension_state(&mut self.nodes, id);
        }
        self.need_reflow = true;
    }
}
