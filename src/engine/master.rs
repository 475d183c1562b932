use std::{
    collections::LinkedList,
    ops::Range,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use thunderdome::Arena;

use crate::{
    config::EngineConfig,
    error::fatal,
    module::{IStream, OStreamIdx},
};

use super::{
    const_values::ConstValueCache,
    flow::FlowJobKind,
    garbage::{Garbage, GarbageSink},
    job::{Job, JobKind},
    node::{EngineNode, JInput, NodeArena, NodeID},
    node_list::MasterNodeList,
    poll::{EngineLoop, PollEntry, PollId, TimerEntry},
    schedule::Schedule,
    scheduler::{propagate_update_suspend, unschedule_node, Scheduler},
    Shared,
};

/// Reusable allocations for building the stream lists handed to modules.
pub(super) struct Scratch {
    pub istreams: Vec<IStream<'static>>,
    pub jvalues: Vec<&'static [f32]>,
    pub jranges: Vec<Range<usize>>,
}

/// The realtime side of an engine instance.
///
/// An embedding application drives it from its realtime thread through
/// [`EngineMaster::prepare`], [`EngineMaster::check`] and
/// [`EngineMaster::dispatch`], or hands it to a
/// [`MasterThread`](crate::MasterThread).
pub struct EngineMaster {
    pub(super) shared: Arc<Shared>,
    pub(super) config: EngineConfig,

    pub(super) nodes: NodeArena,
    pub(super) mnl: MasterNodeList,
    /// Head of the intrusive consumer list.
    consumers: Option<NodeID>,
    pub(super) schedule: Schedule,

    pub(super) need_reflow: bool,
    pub(super) need_process: bool,
    pub(super) tick_stamp: u64,

    polls: Vec<Box<PollEntry>>,
    n_pollfds: usize,
    pollfds_changed: bool,
    timers: Vec<Box<TimerEntry>>,

    /// Nodes with pending boundary jobs.
    boundary_nodes: Vec<NodeID>,
    /// Nodes with pending probe requests.
    pub(super) probe_nodes: Vec<NodeID>,

    pub(super) const_values: ConstValueCache,
    pub(super) garbage: GarbageSink,
    pub(super) scratch: Scratch,
}

impl EngineMaster {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: EngineConfig,
        garbage_tx: rtrb::Producer<Garbage>,
    ) -> Self {
        Self {
            shared,
            nodes: Arena::with_capacity(config.node_capacity),
            mnl: MasterNodeList::default(),
            consumers: None,
            schedule: Schedule::new(),
            need_reflow: true,
            need_process: false,
            tick_stamp: 0,
            polls: Vec::with_capacity(16),
            n_pollfds: 0,
            pollfds_changed: false,
            timers: Vec::with_capacity(16),
            boundary_nodes: Vec::with_capacity(16),
            probe_nodes: Vec::with_capacity(16),
            const_values: ConstValueCache::new(config.block_size, config.const_value_epsilon),
            garbage: GarbageSink::new(garbage_tx, config.garbage_capacity),
            scratch: Scratch {
                istreams: Vec::with_capacity(16),
                jvalues: Vec::with_capacity(32),
                jranges: Vec::with_capacity(8),
            },
            config,
        }
    }

    /// Check whether [`EngineMaster::dispatch`] needs to run now.
    ///
    /// If this returns `false`, `lp` holds the timeout and the file
    /// descriptors to wait on before calling [`EngineMaster::check`].
    pub fn prepare(&mut self, lp: &mut EngineLoop) -> bool {
        lp.timeout = None;
        lp.revents_filled = false;
        lp.fds_changed = self.pollfds_changed;
        if self.pollfds_changed {
            lp.fds.clear();
            for poll in self.polls.iter() {
                lp.fds.extend_from_slice(&poll.fds);
            }
            self.pollfds_changed = false;
        }

        let mut need_dispatch = self.need_reflow || self.need_process;
        if !need_dispatch {
            need_dispatch = self.shared.queue.has_pending();
        }
        if !need_dispatch {
            self.poll_check(&mut lp.timeout, false);
            need_dispatch = self.need_process;
        }

        if need_dispatch {
            lp.timeout = Some(Duration::ZERO);
        }
        need_dispatch
    }

    /// Check again after waiting on the descriptors from
    /// [`EngineMaster::prepare`].
    pub fn check(&mut self, lp: &mut EngineLoop) -> bool {
        if lp.revents_filled {
            let mut revents = lp.fds.iter();
            for poll in self.polls.iter_mut() {
                for fd in poll.fds.iter_mut() {
                    if let Some(filled) = revents.next() {
                        fd.revents = filled.revents;
                    }
                }
            }
        }

        let mut need_dispatch = self.need_reflow || self.need_process;
        if !need_dispatch {
            need_dispatch = self.shared.queue.has_pending();
        }
        if !need_dispatch {
            let mut timeout = None;
            self.poll_check(&mut timeout, lp.revents_filled);
            need_dispatch = self.need_process;
        }
        need_dispatch
    }

    /// Execute pending jobs, rebuild the schedule if the graph changed and
    /// process one block if a poll function asked for it.
    pub fn dispatch(&mut self) {
        self.process_jobs();

        if self.need_reflow {
            self.reschedule_flow();
        }
        if self.need_process {
            self.process_flow();
        }

        self.garbage.flush();
    }

    /// The tick stamp of the next block to process.
    pub fn tick_stamp(&self) -> u64 {
        self.tick_stamp
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// An integrated node.
    pub fn node(&self, id: NodeID) -> Option<&EngineNode> {
        self.nodes.get(id.0).map(|n| &**n)
    }

    /// The tick stamp up to which the node has been processed.
    pub fn node_tick_stamp(&self, id: NodeID) -> Option<u64> {
        self.node(id).map(|n| n.counter)
    }

    pub fn is_scheduled(&self, id: NodeID) -> bool {
        self.node(id).is_some_and(|n| n.sched_tag)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over the consumer list.
    pub fn consumers(&self) -> impl Iterator<Item = NodeID> + '_ {
        std::iter::successors(self.consumers, move |id| self.nodes[id.0].toplevel_next)
    }

    /// Queue `func` to run in the user thread during the next garbage
    /// collection.
    pub fn add_user_callback(&mut self, func: impl FnOnce() + Send + 'static) {
        self.garbage.push(Garbage::UserCallback(Box::new(func)));
    }

    /// Recount every connection and compare against the fan-out
    /// bookkeeping of the source nodes.
    ///
    /// This allocates, so it is meant for tests and debugging.
    pub fn fan_out_consistent(&self) -> bool {
        let mut counted: AHashMap<(NodeID, u16), u32> = AHashMap::new();
        let mut readers: AHashMap<NodeID, usize> = AHashMap::new();
        for (_, node) in self.nodes.iter() {
            let sources = node
                .inputs
                .iter()
                .filter_map(|i| i.src)
                .chain(node.jinputs.iter().flatten().map(|j| (j.src_node, j.src_stream)));
            for (src, ostream) in sources {
                *counted.entry((src, ostream.0)).or_default() += 1;
                *readers.entry(src).or_default() += 1;
            }
        }

        let mut consistent = true;
        for (_, node) in self.nodes.iter() {
            for (o, output) in node.outputs.iter().enumerate() {
                let n = counted.get(&(node.id, o as u16)).copied().unwrap_or(0);
                if n != output.n_outputs {
                    log::warn!(
                        "output {o} of {:?} counts {} readers, found {n}",
                        node.id,
                        output.n_outputs
                    );
                    consistent = false;
                }
            }
            let n = readers.get(&node.id).copied().unwrap_or(0);
            if n != node.output_nodes.len() {
                log::warn!(
                    "{:?} lists {} output nodes, found {n}",
                    node.id,
                    node.output_nodes.len()
                );
                consistent = false;
            }
        }
        consistent
    }

    fn poll_check(&mut self, timeout: &mut Option<Duration>, with_revents: bool) {
        if self.need_process || *timeout == Some(Duration::ZERO) {
            self.need_process = true;
            return;
        }

        let block_size = self.config.block_size;
        let mut need_process = false;
        for poll in self.polls.iter_mut() {
            let PollEntry { func, fds, .. } = &mut **poll;
            let mut poll_timeout = None;
            if (func)(block_size, &mut poll_timeout, fds, with_revents)
                || poll_timeout == Some(Duration::ZERO)
            {
                need_process = true;
                *timeout = Some(Duration::ZERO);
                break;
            }
            if let Some(t) = poll_timeout {
                *timeout = Some(timeout.map_or(t, |cur| cur.min(t)));
            }
        }

        self.need_process = need_process;
    }

    fn process_jobs(&mut self) {
        let mut active = LinkedList::new();
        loop {
            while self.shared.queue.swap_active(&mut active, self.tick_stamp) {
                for jobs in active.iter_mut() {
                    for job in jobs.iter_mut() {
                        self.execute_job(job);
                    }
                }
            }

            if self.boundary_nodes.is_empty() {
                break;
            }
            self.run_boundary_jobs();
            if !self.shared.queue.has_pending() {
                break;
            }
        }
    }

    /// Run every boundary job that is due before the end of the next
    /// block.
    fn run_boundary_jobs(&mut self) {
        let last_tick = self.tick_stamp + self.config.block_size as u64 - 1;

        let mut i = 0;
        while i < self.boundary_nodes.len() {
            let id = self.boundary_nodes[i];
            let mut discard = false;

            while let Some(mut job) = self.nodes[id.0].boundary_jobs.pop_due(last_tick) {
                log::trace!(
                    "boundary job for {id:?} at {} (tick {})",
                    job.tick_stamp,
                    self.tick_stamp
                );

                let node = &mut self.nodes[id.0];
                node.counter = node.counter.max(self.tick_stamp);
                match &mut job.kind {
                    FlowJobKind::Access { func, .. } => {
                        if let (Some(func), Some(module)) = (func.take(), node.module.as_deref_mut())
                        {
                            (func)(module);
                        }
                    }
                    FlowJobKind::Resume => self.resume_node(id, job.tick_stamp),
                    FlowJobKind::Discard => discard = true,
                }

                self.garbage.push(Garbage::FlowJob(job));
            }

            if discard {
                // Also drops the node from `boundary_nodes`.
                if let Some(node) = self.discard(id) {
                    self.garbage.push(Garbage::Node(node));
                }
            } else if self.nodes[id.0].boundary_jobs.is_empty() {
                self.boundary_nodes.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn integrated(&self, id: NodeID, what: &str) -> bool {
        match self.nodes.get(id.0) {
            Some(node) if node.integrated => true,
            _ => {
                log::warn!("{what}: node {id:?} is not integrated");
                false
            }
        }
    }

    pub(super) fn execute_job(&mut self, job: &mut Job) {
        match &mut job.kind {
            JobKind::Nop => {}
            JobKind::Debug(msg) => {
                log::debug!("debug job: {msg}");
            }
            JobKind::Integrate(node) => {
                if let Some(node) = node.take() {
                    self.integrate(node);
                }
            }
            JobKind::Discard { node, discarded } => {
                *discarded = self.discard(*node);
            }
            JobKind::KillInputs(id) => {
                log::debug!("kill_inputs({id:?})");
                if self.integrated(*id, "kill_inputs") {
                    self.kill_inputs(*id);
                    self.need_reflow = true;
                }
            }
            JobKind::KillOutputs(id) => {
                log::debug!("kill_outputs({id:?})");
                if self.integrated(*id, "kill_outputs") {
                    self.kill_outputs(*id);
                    self.need_reflow = true;
                }
            }
            JobKind::Connect {
                src,
                ostream,
                dest,
                istream,
            } => {
                let (src, dest) = (*src, *dest);
                let (ostream, istream) = (usize::from(ostream.0), usize::from(istream.0));
                log::debug!("connect({dest:?},{istream},{src:?},{ostream})");
                self.iconnect(src, ostream, dest, istream);
            }
            JobKind::JointConnect {
                src,
                ostream,
                dest,
                jstream,
            } => {
                let (src, dest) = (*src, *dest);
                let (ostream, jstream) = (usize::from(ostream.0), usize::from(jstream.0));
                log::debug!("jconnect({dest:?},{jstream},{src:?},{ostream})");
                self.jconnect(src, ostream, dest, jstream);
            }
            JobKind::Disconnect { dest, istream } => {
                let (dest, istream) = (*dest, usize::from(istream.0));
                log::debug!("disconnect({dest:?},{istream})");
                if !self.integrated(dest, "disconnect") {
                    return;
                }
                let connected = self.nodes[dest.0]
                    .inputs
                    .get(istream)
                    .is_some_and(|i| i.src.is_some());
                if connected {
                    self.idisconnect(dest, istream);
                    self.need_reflow = true;
                } else {
                    log::warn!("disconnect: input {istream} of {dest:?} is not connected");
                }
            }
            JobKind::JointDisconnect {
                src,
                ostream,
                dest,
                jstream,
            } => {
                let (src, dest) = (*src, *dest);
                let (ostream, jstream) = (usize::from(ostream.0), usize::from(jstream.0));
                log::debug!("jdisconnect({dest:?},{jstream},{src:?},{ostream})");
                if !self.integrated(dest, "jdisconnect") {
                    return;
                }
                let position = self.nodes[dest.0].jinputs.get(jstream).and_then(|j| {
                    j.iter()
                        .position(|c| c.src_node == src && usize::from(c.src_stream.0) == ostream)
                });
                match position {
                    Some(c) => {
                        self.jdisconnect(dest, jstream, c);
                        self.need_reflow = true;
                    }
                    None => log::warn!(
                        "jdisconnect(dest:{dest:?},{jstream},src:{src:?},{ostream}): no such connection"
                    ),
                }
            }
            JobKind::SetConsumer(id) => self.set_consumer(*id, true),
            JobKind::UnsetConsumer(id) => self.set_consumer(*id, false),
            JobKind::Suspend { node, tick_stamp } => {
                let (id, stamp) = (*node, *tick_stamp);
                log::debug!("suspend({id:?},{stamp})");
                if !self.integrated(id, "suspend") {
                    return;
                }
                if self.nodes[id.0].local_active < stamp {
                    propagate_update_suspend(&mut self.nodes, id);
                    let node = &mut self.nodes[id.0];
                    node.local_active = stamp;
                    node.needs_reset = true;
                    self.need_reflow = true;
                }
            }
            JobKind::ForceReset(id) => {
                log::debug!("force_reset({id:?})");
                if self.integrated(*id, "force_reset") {
                    let node = &mut self.nodes[id.0];
                    node.counter = node.counter.max(self.tick_stamp);
                    node.needs_reset = true;
                }
            }
            JobKind::Access { node, func, .. } => {
                let id = *node;
                log::debug!("access({id:?})");
                if !self.integrated(id, "access") {
                    return;
                }
                let node = &mut self.nodes[id.0];
                node.counter = node.counter.max(self.tick_stamp);
                if let (Some(func), Some(module)) = (func.take(), node.module.as_deref_mut()) {
                    (func)(module);
                }
            }
            JobKind::AddFlowJob { node, job } => {
                let id = *node;
                log::debug!("add_flow_job({id:?})");
                if !self.integrated(id, "add_flow_job") {
                    return;
                }
                if let Some(job) = job.take() {
                    self.nodes[id.0].flow_jobs.insert(job);
                    self.mnl.node_changed(&mut self.nodes, id);
                }
            }
            JobKind::AddBoundaryJob { node, job } => {
                let id = *node;
                log::debug!("add_boundary_job({id:?})");
                if !self.integrated(id, "add_boundary_job") {
                    return;
                }
                if let Some(job) = job.take() {
                    let node = &mut self.nodes[id.0];
                    if node.boundary_jobs.is_empty() {
                        self.boundary_nodes.push(id);
                    }
                    node.boundary_jobs.insert(job);
                }
            }
            JobKind::ProbeRequest { node, job } => {
                let id = *node;
                log::debug!("probe_request({id:?})");
                if !self.integrated(id, "probe_request") {
                    return;
                }
                if let Some(job) = job.take() {
                    let node = &mut self.nodes[id.0];
                    if node.probe_jobs.is_empty() {
                        self.probe_nodes.push(id);
                    }
                    node.probe_jobs.push(job);
                }
            }
            JobKind::UserCallback(_) => {}
            JobKind::AddPoll(poll) => {
                if let Some(poll) = poll.take() {
                    self.add_poll(poll);
                }
            }
            JobKind::RemovePoll { id, removed } => {
                *removed = self.remove_poll(*id);
            }
            JobKind::AddTimer(timer) => {
                if let Some(timer) = timer.take() {
                    log::debug!("add_timer");
                    self.timers.push(timer);
                }
            }
        }
    }

    fn integrate(&mut self, node: Box<EngineNode>) {
        let id = node.id;
        log::debug!("integrate({id:?})");

        if self.nodes.get(id.0).is_some() {
            log::warn!("integrate: node {id:?} is already integrated");
            return;
        }
        let _ = self.nodes.insert_at(id.0, node);
        self.mnl.integrate(&mut self.nodes, id);

        let node = &mut self.nodes[id.0];
        node.counter = self.tick_stamp;
        node.local_active = 0;
        node.update_suspend = true;
        node.needs_reset = true;
        if node.is_consumer() {
            self.add_consumer(id);
        }
        self.need_reflow = true;
    }

    fn discard(&mut self, id: NodeID) -> Option<Box<EngineNode>> {
        log::debug!("discard({id:?})");
        if !self.integrated(id, "discard") {
            return None;
        }

        // The schedule must not refer to the node anymore.
        self.discard_schedule();
        self.need_reflow = true;

        self.kill_inputs(id);
        self.kill_outputs(id);
        self.remove_consumer(id);
        self.mnl.remove(&mut self.nodes, id);
        // Pending boundary jobs and probes are released with the node.
        for list in [&mut self.boundary_nodes, &mut self.probe_nodes] {
            if let Some(pos) = list.iter().position(|&n| n == id) {
                list.swap_remove(pos);
            }
        }

        let mut node = self.nodes.remove(id.0)?;
        node.counter = u64::MAX;
        Some(node)
    }

    fn kill_inputs(&mut self, id: NodeID) {
        for istream in 0..self.nodes[id.0].inputs.len() {
            if self.nodes[id.0].inputs[istream].src.is_some() {
                self.idisconnect(id, istream);
            }
        }
        for jstream in 0..self.nodes[id.0].jinputs.len() {
            while let Some(last) = self.nodes[id.0].jinputs[jstream].len().checked_sub(1) {
                self.jdisconnect(id, jstream, last);
            }
        }
    }

    fn kill_outputs(&mut self, id: NodeID) {
        while let Some(&dest) = self.nodes[id.0].output_nodes.first() {
            let mut severed = false;

            for istream in 0..self.nodes[dest.0].inputs.len() {
                if self.nodes[dest.0].inputs[istream]
                    .src
                    .is_some_and(|(src, _)| src == id)
                {
                    self.idisconnect(dest, istream);
                    severed = true;
                }
            }
            for jstream in 0..self.nodes[dest.0].jinputs.len() {
                let mut c = 0;
                while c < self.nodes[dest.0].jinputs[jstream].len() {
                    if self.nodes[dest.0].jinputs[jstream][c].src_node == id {
                        self.jdisconnect(dest, jstream, c);
                        severed = true;
                    } else {
                        c += 1;
                    }
                }
            }

            if !severed {
                fatal(format_args!(
                    "output list of node {id:?} refers to {dest:?}, which does not read from it"
                ));
            }
        }
    }

    fn check_ostream(&self, src: NodeID, ostream: usize, what: &str) -> bool {
        if ostream < self.nodes[src.0].outputs.len() {
            true
        } else {
            log::warn!("{what}: node {src:?} has no output stream {ostream}");
            false
        }
    }

    fn iconnect(&mut self, src: NodeID, ostream: usize, dest: NodeID, istream: usize) {
        if !self.integrated(src, "connect") || !self.integrated(dest, "connect") {
            return;
        }
        if src == dest {
            log::warn!("connect: cannot connect node {src:?} to itself");
            return;
        }
        if !self.check_ostream(src, ostream, "connect") {
            return;
        }
        match self.nodes[dest.0].inputs.get_mut(istream) {
            Some(input) if input.src.is_none() => input.src = Some((src, OStreamIdx(ostream as u16))),
            Some(_) => {
                log::warn!("connect: input {istream} of node {dest:?} is already connected");
                return;
            }
            None => {
                log::warn!("connect: node {dest:?} has no input stream {istream}");
                return;
            }
        }

        self.add_output(src, ostream, dest);
    }

    fn jconnect(&mut self, src: NodeID, ostream: usize, dest: NodeID, jstream: usize) {
        if !self.integrated(src, "jconnect") || !self.integrated(dest, "jconnect") {
            return;
        }
        if src == dest {
            log::warn!("jconnect: cannot connect node {src:?} to itself");
            return;
        }
        if !self.check_ostream(src, ostream, "jconnect") {
            return;
        }
        let Some(jinputs) = self.nodes[dest.0].jinputs.get_mut(jstream) else {
            log::warn!("jconnect: node {dest:?} has no joint stream {jstream}");
            return;
        };
        jinputs.push(JInput {
            src_node: src,
            src_stream: OStreamIdx(ostream as u16),
        });

        self.add_output(src, ostream, dest);
    }

    /// Account for a new connection reading from `src`.
    fn add_output(&mut self, src: NodeID, ostream: usize, dest: NodeID) {
        let was_consumer = self.nodes[src.0].is_consumer();

        let src_node = &mut self.nodes[src.0];
        src_node.outputs[ostream].n_outputs += 1;
        src_node.outputs[ostream].connected = false;
        src_node.output_nodes.push(dest);

        propagate_update_suspend(&mut self.nodes, src);

        // Something reads from it now, so it is not a consumer anymore.
        if was_consumer {
            self.remove_consumer(src);
        }
        self.need_reflow = true;
    }

    fn idisconnect(&mut self, dest: NodeID, istream: usize) {
        let Some((src, ostream)) = self.nodes[dest.0].inputs[istream].src.take() else {
            return;
        };
        self.remove_output(src, usize::from(ostream.0), dest);
    }

    fn jdisconnect(&mut self, dest: NodeID, jstream: usize, connection: usize) {
        let input = self.nodes[dest.0].jinputs[jstream].remove(connection);
        self.remove_output(input.src_node, usize::from(input.src_stream.0), dest);
    }

    /// Account for a removed connection reading from `src`.
    fn remove_output(&mut self, src: NodeID, ostream: usize, dest: NodeID) {
        let was_consumer = self.nodes[src.0].is_consumer();

        let src_node = &mut self.nodes[src.0];
        let output = &mut src_node.outputs[ostream];
        if output.n_outputs == 0 {
            fatal(format_args!(
                "fan-out of output {ostream} of node {src:?} would drop below zero"
            ));
        }
        output.n_outputs -= 1;
        output.connected = false;
        if let Some(pos) = src_node.output_nodes.iter().position(|&n| n == dest) {
            src_node.output_nodes.remove(pos);
        }

        propagate_update_suspend(&mut self.nodes, src);

        if !was_consumer && self.nodes[src.0].is_consumer() {
            self.add_consumer(src);
        }
    }

    fn set_consumer(&mut self, id: NodeID, is_consumer: bool) {
        log::debug!("set_consumer({id:?},{is_consumer})");
        if !self.integrated(id, "set_consumer") {
            return;
        }

        let node = &mut self.nodes[id.0];
        let was_consumer = node.is_consumer();
        node.is_consumer = is_consumer;
        if was_consumer != node.is_consumer() {
            if is_consumer {
                self.add_consumer(id);
            } else {
                self.remove_consumer(id);
            }
            propagate_update_suspend(&mut self.nodes, id);
            self.need_reflow = true;
        }
    }

    fn add_consumer(&mut self, id: NodeID) {
        self.nodes[id.0].toplevel_next = self.consumers;
        self.consumers = Some(id);
    }

    fn remove_consumer(&mut self, id: NodeID) {
        let mut prev: Option<NodeID> = None;
        let mut cursor = self.consumers;

        while let Some(current) = cursor {
            let next = self.nodes[current.0].toplevel_next;
            if current == id {
                match prev {
                    Some(prev) => self.nodes[prev.0].toplevel_next = next,
                    None => self.consumers = next,
                }
                self.nodes[current.0].toplevel_next = None;
                return;
            }
            prev = Some(current);
            cursor = next;
        }
    }

    fn add_poll(&mut self, poll: Box<PollEntry>) {
        log::debug!("add_poll({:?})", poll.id);

        let n_fds = poll.fds.len();
        if self.n_pollfds + n_fds > self.config.max_poll_fds {
            fatal(format_args!(
                "adding poll job exceeds maximum number of poll-fds ({} > {})",
                self.n_pollfds + n_fds,
                self.config.max_poll_fds
            ));
        }

        self.n_pollfds += n_fds;
        if n_fds > 0 {
            self.pollfds_changed = true;
        }
        self.polls.push(poll);
    }

    fn remove_poll(&mut self, id: PollId) -> Option<Box<PollEntry>> {
        log::debug!("remove_poll({id:?})");

        let Some(pos) = self.polls.iter().position(|p| p.id == id) else {
            log::warn!("remove_poll: failed to remove unknown poll function {id:?}");
            return None;
        };

        let poll = self.polls.remove(pos);
        self.n_pollfds -= poll.fds.len();
        if !poll.fds.is_empty() {
            self.pollfds_changed = true;
        }
        Some(poll)
    }

    /// Unsecure and clear the schedule so that nodes can be removed.
    fn discard_schedule(&mut self) {
        if self.schedule.is_secured() {
            self.schedule.unsecure();
        }

        let nodes = &mut self.nodes;
        let mnl = &mut self.mnl;
        self.schedule.clear(|id| {
            unschedule_node(nodes, id);
            if nodes.get(id.0).is_some_and(|n| !n.flow_jobs.is_empty()) {
                mnl.node_changed(nodes, id);
            }
        });
    }

    fn reschedule_flow(&mut self) {
        log::debug!("reschedule flow at {}", self.tick_stamp);

        self.discard_schedule();

        let mut cursor = self.consumers;
        while let Some(id) = cursor {
            cursor = self.nodes[id.0].toplevel_next;

            let result = Scheduler::new(
                &mut self.schedule,
                &mut self.nodes,
                &mut self.mnl,
                self.tick_stamp,
            )
            .schedule_consumer(id);
            if let Err(err) = result {
                fatal(format_args!("{err}"));
            }
        }

        self.schedule.secure();
        self.need_reflow = false;
        log::debug!("schedule holds {} items", self.schedule.n_items());
    }

    /// Advance the tick stamp by one block and run the timers.
    pub(super) fn advance_tick(&mut self) {
        self.tick_stamp += self.config.block_size as u64;
        self.shared
            .tick_stamp
            .store(self.tick_stamp, Ordering::Release);
        if let Some(mut last_update) = self.shared.last_update.try_lock() {
            *last_update = (self.tick_stamp, Instant::now());
        }

        let mut i = 0;
        while i < self.timers.len() {
            if (self.timers[i].func)(self.tick_stamp) {
                i += 1;
            } else {
                let timer = self.timers.remove(i);
                self.garbage.push(Garbage::Timer(timer));
            }
        }
    }
}

impl Drop for EngineMaster {
    fn drop(&mut self) {
        // Module `free()` and the free callbacks must run in the user
        // thread, so send everything back through the garbage ring.
        for (_, node) in self.nodes.drain() {
            self.garbage.push(Garbage::Node(node));
        }
        for timer in self.timers.drain(..) {
            self.garbage.push(Garbage::Timer(timer));
        }
        for poll in self.polls.drain(..) {
            self.garbage.push(Garbage::Poll(poll));
        }
        let garbage = &mut self.garbage;
        self.const_values
            .clear(|block| garbage.push(Garbage::ConstBlock(block)));

        let shared = Arc::clone(&self.shared);
        self.garbage.drain_overflow(|garbage| {
            log::warn!("garbage ring is full, releasing garbage on the master thread");
            garbage.release(&shared);
        });
    }
}
