pub(crate) mod const_values;
mod flow;
mod garbage;
mod job;
mod master;
pub(crate) mod node;
mod node_list;
mod poll;
mod probe;
mod process;
mod queue;
mod schedule;
mod scheduler;
mod thread;
mod transaction;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::Thread,
    time::Instant,
};

use parking_lot::Mutex;
use thunderdome::Arena;

use garbage::Garbage;
use queue::JobQueue;

use crate::{config::EngineConfig, error::EngineError, module::Module};

pub use const_values::ConstValueCache;
pub use flow::{AccessFn, FlowJob, FreeFn};
pub use job::Job;
pub use master::EngineMaster;
pub use node::{EngineNode, ModuleHandle, NodeID};
pub use poll::{EngineLoop, PollFd, PollFn, PollId, TimerFn};
pub use probe::{Probe, ProbeFn};
pub use thread::MasterThread;
pub use transaction::Transaction;

/// State shared between the user side and the master loop.
pub(crate) struct Shared {
    config: EngineConfig,
    queue: JobQueue,
    /// Mirror of the master loop's tick stamp.
    tick_stamp: AtomicU64,
    /// The tick stamp of the last processed block and when it finished.
    last_update: Mutex<(u64, Instant)>,
    /// The thread to unpark when a transaction is committed.
    wakeup: Mutex<Option<Thread>>,
    /// Allocates node ids, so ids stay unique while a node is in flight.
    node_ids: Mutex<Arena<()>>,
}

impl Shared {
    fn tick_stamp(&self) -> u64 {
        self.tick_stamp.load(Ordering::Acquire)
    }

    fn wakeup(&self) {
        if let Some(thread) = self.wakeup.lock().as_ref() {
            thread.unpark();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Both ends are gone, so nothing picks these up anymore.
        let pending = self.queue.take_pending();
        let trash = self.queue.take_trash();
        for jobs in pending.into_iter().chain(trash) {
            for job in jobs {
                job.release(self);
            }
        }
    }
}

/// Create a new engine instance.
///
/// The returned [`Engine`] is used from user threads to create modules,
/// commit transactions and collect garbage. The [`EngineMaster`] belongs
/// to the realtime thread.
pub fn engine_init(config: EngineConfig) -> Result<(Engine, EngineMaster), EngineError> {
    config.validate()?;

    let (garbage_tx, garbage_rx) = rtrb::RingBuffer::<Garbage>::new(config.garbage_capacity);

    let shared = Arc::new(Shared {
        config,
        queue: JobQueue::new(config.block_size),
        tick_stamp: AtomicU64::new(0),
        last_update: Mutex::new((0, Instant::now())),
        wakeup: Mutex::new(None),
        node_ids: Mutex::new(Arena::with_capacity(config.node_capacity)),
    });

    log::debug!(
        "engine initialized: block_size={} sample_freq={} control_raster={}",
        config.block_size,
        config.sample_freq,
        config.control_raster()
    );

    let engine = Engine {
        shared: Arc::clone(&shared),
        garbage: Mutex::new(garbage_rx),
    };
    let master = EngineMaster::new(shared, config, garbage_tx);

    Ok((engine, master))
}

/// The user thread side of an engine instance.
pub struct Engine {
    shared: Arc<Shared>,
    garbage: Mutex<rtrb::Consumer<Garbage>>,
}

impl Engine {
    /// Wrap a module into a node, ready to be added with
    /// [`Job::integrate`].
    pub fn module_new(&self, module: impl Module) -> Box<EngineNode> {
        let id = NodeID(self.shared.node_ids.lock().insert(()));
        Box::new(EngineNode::new(
            id,
            Box::new(module),
            self.shared.config.block_size,
        ))
    }

    pub fn transaction_open(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.shared))
    }

    /// The tick stamp of the next block the master loop processes.
    pub fn tick_stamp(&self) -> u64 {
        self.shared.tick_stamp()
    }

    /// Estimate the tick stamp corresponding to a point in time, based on
    /// when the master loop finished its last block.
    pub fn tick_stamp_from_systime(&self, systime: Instant) -> u64 {
        let (stamp, updated) = *self.shared.last_update.lock();
        let freq = u128::from(self.shared.config.sample_freq);

        if systime >= updated {
            let frames = systime.duration_since(updated).as_nanos() * freq / 1_000_000_000;
            stamp.saturating_add(frames as u64)
        } else {
            let frames = updated.duration_since(systime).as_nanos() * freq / 1_000_000_000;
            stamp.saturating_sub(frames as u64)
        }
    }

    /// Block until the master loop has executed every committed
    /// transaction.
    pub fn wait_on_transactions(&self) {
        self.shared.queue.wait_idle();
    }

    /// Release everything the master loop is done with.
    ///
    /// Runs [`Module::free`] of discarded modules and the free functions
    /// of executed jobs, in the calling thread.
    pub fn garbage_collect(&self) {
        for jobs in self.shared.queue.take_trash() {
            for job in jobs {
                job.release(&self.shared);
            }
        }

        let mut garbage = self.garbage.lock();
        while let Ok(g) = garbage.pop() {
            g.release(&self.shared);
        }
    }

    /// Queue `func` to run during the next garbage collection.
    ///
    /// This may be called from any thread. Use
    /// [`EngineMaster::add_user_callback`] from the realtime thread.
    pub fn add_user_callback(&self, func: impl FnOnce() + Send + 'static) {
        self.shared
            .queue
            .push_trash(vec![Job::user_callback(Box::new(func))]);
    }

    pub fn has_garbage(&self) -> bool {
        self.shared.queue.has_trash() || !self.garbage.lock().is_empty()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn block_size(&self) -> usize {
        self.shared.config.block_size
    }

    pub fn sample_freq(&self) -> u32 {
        self.shared.config.sample_freq
    }

    pub fn sub_sample_mask(&self) -> u32 {
        self.shared.config.sub_sample_mask
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.garbage_collect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;

    use super::*;
    use crate::{util, ModuleClass, ModuleFlags, ProcessContext};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Reset,
        Process(u64, usize),
        Access,
        Free,
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    /// Writes a constant and records every call.
    struct Recorder {
        value: f32,
        events: Events,
    }

    impl Module for Recorder {
        fn class(&self) -> ModuleClass {
            ModuleClass::new(0, 1)
        }

        fn process(&mut self, cx: &mut ProcessContext<'_>, n_values: usize) {
            self.events
                .lock()
                .push(Event::Process(cx.tick_stamp(), n_values));
            util::block_fill(cx.ostream(0), self.value);
        }

        fn reset(&mut self) {
            self.events.lock().push(Event::Reset);
        }

        fn free(&mut self) {
            self.events.lock().push(Event::Free);
        }
    }

    struct Gain(f32, ModuleFlags);

    impl Module for Gain {
        fn class(&self) -> ModuleClass {
            ModuleClass::new(1, 1).with_flags(self.1)
        }

        fn process(&mut self, cx: &mut ProcessContext<'_>, n_values: usize) {
            for i in 0..n_values {
                let v = cx.istream(0)[i] * self.0;
                cx.ostream(0)[i] = v;
            }
        }
    }

    struct Mixer;

    impl Module for Mixer {
        fn class(&self) -> ModuleClass {
            ModuleClass::new(1, 1).with_jstreams(1)
        }

        fn process(&mut self, cx: &mut ProcessContext<'_>, n_values: usize) {
            for i in 0..n_values {
                let v = cx.istream(0)[i] + cx.jstream(0).iter().map(|s| s[i]).sum::<f32>();
                cx.ostream(0)[i] = v;
            }
        }
    }

    /// Records the first value of every block it reads.
    struct Sink(Arc<Mutex<Vec<(f32, bool)>>>);

    impl Module for Sink {
        fn class(&self) -> ModuleClass {
            ModuleClass::new(1, 0)
        }

        fn process(&mut self, cx: &mut ProcessContext<'_>, _n_values: usize) {
            let first = cx.istream(0)[0];
            let connected = cx.istream_connected(0);
            self.0.lock().push((first, connected));
        }
    }

    struct Harness {
        engine: Engine,
        master: EngineMaster,
        lp: EngineLoop,
    }

    impl Harness {
        fn new() -> Self {
            let (engine, master) = engine_init(EngineConfig::default()).unwrap();
            let lp = EngineLoop::with_capacity(engine.config().max_poll_fds);

            let mut h = Self { engine, master, lp };
            let (poll, _) = Job::add_poll(&h.engine, Vec::new(), |_, _, _, _| true, None).unwrap();
            h.commit(vec![poll]);
            h.master.dispatch();
            h
        }

        fn commit(&self, jobs: Vec<Job>) -> u64 {
            let mut trans = self.engine.transaction_open();
            for job in jobs {
                trans.add(job);
            }
            trans.commit()
        }

        fn integrate(&self, module: impl Module, consumer: bool) -> ModuleHandle {
            let node = self.engine.module_new(module);
            let handle = node.handle();
            let mut jobs = vec![Job::integrate(node)];
            if consumer {
                jobs.push(Job::set_consumer(handle));
            }
            self.commit(jobs);
            handle
        }

        /// Dispatch until one block was processed.
        fn run_block(&mut self) {
            let tick_stamp = self.master.tick_stamp();
            while self.master.tick_stamp() == tick_stamp {
                assert!(self.master.prepare(&mut self.lp) || self.master.check(&mut self.lp));
                self.master.dispatch();
            }
        }

        fn node(&self, handle: ModuleHandle) -> &EngineNode {
            self.master.node(handle.id()).unwrap()
        }
    }

    #[test]
    fn init_rejects_invalid_config() {
        let config = EngineConfig {
            block_size: 100,
            ..Default::default()
        };
        assert_eq!(
            engine_init(config).err(),
            Some(EngineError::InvalidBlockSize(100))
        );
    }

    #[test]
    fn transactions_run_in_commit_order() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            false,
        );
        h.master.dispatch();

        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |n: u32| {
            let order = Arc::clone(&order);
            Job::access(m, move |_| order.lock().push(n), None)
        };

        let mut t1 = h.engine.transaction_open();
        t1.add(push(1));
        t1.add(push(2));
        let mut t2 = h.engine.transaction_open();
        t2.add(push(3));
        t1.commit();
        t2.commit();

        h.master.dispatch();
        assert_eq!(*order.lock(), vec![1, 2, 3]);

        // Dismissed jobs never run, but their free functions do.
        let freed = Arc::new(AtomicUsize::new(0));
        let mut t3 = h.engine.transaction_open();
        let free_count = Arc::clone(&freed);
        t3.add(Job::access(
            m,
            |_| unreachable!(),
            Some(Box::new(move || {
                free_count.fetch_add(1, Ordering::Relaxed);
            })),
        ));
        t3.dismiss();
        h.master.dispatch();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(freed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn merged_transactions_keep_job_order() {
        let h = Harness::new();
        let mut a = h.engine.transaction_open();
        a.add(Job::nop());
        let mut b = h.engine.transaction_open();
        b.add(Job::debug("merged"));
        b.add(Job::nop());

        a.merge(b);
        assert_eq!(a.len(), 3);
        assert!(a.commit() > 0);
    }

    #[test]
    fn commit_stamp_follows_the_master() {
        let mut h = Harness::new();
        let block_size = h.engine.block_size() as u64;

        assert_eq!(h.engine.transaction_open().commit(), 0);
        assert_eq!(h.commit(vec![Job::nop()]), block_size);

        h.run_block();
        assert_eq!(h.engine.tick_stamp(), block_size);
        // Refreshed once the queue is drained at the new stamp.
        h.master.dispatch();
        assert_eq!(h.commit(vec![Job::nop()]), 2 * block_size);
    }

    #[test]
    fn chain_is_scheduled_in_dependency_order() {
        let mut h = Harness::new();
        let a = h.integrate(
            Recorder {
                value: 1.0,
                events: Events::default(),
            },
            true,
        );
        let b = h.integrate(Gain(1.0, ModuleFlags::NONE), false);
        let c = h.integrate(Sink(Arc::default()), true);
        h.commit(vec![
            Job::connect(a, 0, b, 0).unwrap(),
            Job::connect(b, 0, c, 0).unwrap(),
        ]);
        h.master.dispatch();

        for m in [a, b, c] {
            assert!(h.master.is_scheduled(m.id()));
        }
        assert!(h.node(a).leaf_level() < h.node(b).leaf_level());
        assert!(h.node(b).leaf_level() < h.node(c).leaf_level());

        // A reads into B, so only C is a consumer.
        assert_eq!(h.master.consumers().collect::<Vec<_>>(), vec![c.id()]);

        h.run_block();
        for m in [a, b, c] {
            assert_eq!(h.master.node_tick_stamp(m.id()), Some(128));
        }
    }

    #[test]
    fn signal_flows_through_the_graph() {
        let mut h = Harness::new();
        let source = |value| Recorder {
            value,
            events: Events::default(),
        };
        let a = h.integrate(source(0.25), false);
        let b = h.integrate(source(0.5), false);
        let c = h.integrate(source(0.125), false);
        let mix = h.integrate(Mixer, false);
        let gain = h.integrate(Gain(2.0, ModuleFlags::NONE), false);
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = h.integrate(Sink(Arc::clone(&values)), true);
        let unconnected = Arc::new(Mutex::new(Vec::new()));
        h.integrate(Sink(Arc::clone(&unconnected)), true);

        h.commit(vec![
            Job::jconnect(a, 0, mix, 0).unwrap(),
            Job::jconnect(b, 0, mix, 0).unwrap(),
            Job::connect(c, 0, mix, 0).unwrap(),
            Job::connect(mix, 0, gain, 0).unwrap(),
            Job::connect(gain, 0, sink, 0).unwrap(),
        ]);
        h.run_block();

        assert_eq!(*values.lock(), vec![(1.75, true)]);
        assert_eq!(*unconnected.lock(), vec![(0.0, false)]);
        assert_eq!(h.node(mix).jstream_connections(0), 2);
        assert!(h.master.fan_out_consistent());
    }

    #[test]
    fn discard_severs_every_connection() {
        let mut h = Harness::new();
        let events = Events::default();
        let src = h.integrate(
            Recorder {
                value: 1.0,
                events: Events::default(),
            },
            false,
        );
        let n = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        let mix = h.integrate(Mixer, true);
        let sink = h.integrate(Sink(Arc::default()), true);
        h.commit(vec![
            Job::jconnect(src, 0, mix, 0).unwrap(),
            Job::jconnect(n, 0, mix, 0).unwrap(),
            Job::connect(mix, 0, sink, 0).unwrap(),
        ]);
        h.run_block();
        let nodes = h.master.num_nodes();
        assert_eq!(h.node(src).fan_out(0), 1);
        assert!(!h.master.consumers().any(|id| id == mix.id()));

        // Discard the mixer, which reads from two nodes and is read by one.
        h.commit(vec![Job::discard(mix)]);
        h.master.dispatch();

        assert!(h.master.node(mix.id()).is_none());
        assert_eq!(h.master.num_nodes(), nodes - 1);
        assert_eq!(h.node(src).fan_out(0), 0);
        assert_eq!(h.node(n).fan_out(0), 0);
        assert!(!h.node(sink).has_source(0));
        assert!(h.master.fan_out_consistent());

        // N has nothing downstream anymore and is a consumer again.
        let consumers: Vec<_> = h.master.consumers().collect();
        assert!(consumers.contains(&n.id()));
        assert!(consumers.contains(&sink.id()));
        assert!(!consumers.contains(&mix.id()));
        h.run_block();

        h.commit(vec![Job::discard(n)]);
        h.master.dispatch();
        assert!(h.engine.has_garbage());
        h.engine.garbage_collect();
        assert_eq!(events.lock().last(), Some(&Event::Free));
        assert!(!h.engine.has_garbage());
    }

    #[test]
    fn flow_job_splits_the_block() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();
        assert_eq!(
            std::mem::take(&mut *events.lock()),
            vec![Event::Reset, Event::Process(0, 128)]
        );

        h.commit(vec![Job::flow_access(
            m,
            200,
            |module| {
                if let Some(recorder) = module.downcast_mut::<Recorder>() {
                    recorder.events.lock().push(Event::Access);
                }
            },
            None,
        )]);
        h.run_block();
        assert_eq!(
            std::mem::take(&mut *events.lock()),
            vec![
                Event::Process(128, 72),
                Event::Access,
                Event::Process(200, 56)
            ]
        );

        h.run_block();
        assert_eq!(*events.lock(), vec![Event::Process(256, 128)]);
    }

    #[test]
    fn flow_jobs_run_on_unscheduled_nodes() {
        let mut h = Harness::new();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Events::default(),
            },
            false,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let job = |stamp| {
            let hits = Arc::clone(&hits);
            Job::flow_access(
                m,
                stamp,
                move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
        };
        h.commit(vec![job(100), job(300)]);

        h.run_block();
        assert!(!h.master.is_scheduled(m.id()));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        h.run_block();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        h.run_block();
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        h.engine.garbage_collect();
        assert!(!h.engine.has_garbage());
    }

    #[test]
    fn suspended_nodes_skip_processing() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 1.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();
        events.lock().clear();

        h.commit(vec![Job::suspend_now(m)]);
        h.run_block();
        assert!(events.lock().is_empty());

        h.commit(vec![Job::resume_at(m, 300).unwrap()]);
        h.run_block();
        assert_eq!(
            *events.lock(),
            vec![Event::Reset, Event::Process(300, 84)]
        );
    }

    #[test]
    fn cycle_through_delay_is_processed() {
        let mut h = Harness::new();
        let a = h.integrate(Mixer, false);
        let b = h.integrate(Gain(0.5, ModuleFlags::DELAY), false);
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = h.integrate(Sink(Arc::clone(&values)), true);
        let src = h.integrate(
            Recorder {
                value: 1.0,
                events: Events::default(),
            },
            false,
        );
        h.commit(vec![
            Job::connect(src, 0, a, 0).unwrap(),
            Job::jconnect(b, 0, a, 0).unwrap(),
            Job::connect(a, 0, b, 0).unwrap(),
            Job::connect(a, 0, sink, 0).unwrap(),
        ]);
        h.master.dispatch();
        assert_eq!(h.node(a).leaf_level(), h.node(b).leaf_level());

        for _ in 0..3 {
            h.run_block();
        }
        assert_eq!(values.lock().len(), 3);
        assert_eq!(values.lock()[0], (1.0, true));
    }

    #[test]
    fn timers_run_until_they_return_false() {
        let mut h = Harness::new();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let freed = Arc::new(AtomicUsize::new(0));

        let timer_stamps = Arc::clone(&stamps);
        let free_count = Arc::clone(&freed);
        h.commit(vec![Job::add_timer(
            move |tick_stamp| {
                let mut stamps = timer_stamps.lock();
                stamps.push(tick_stamp);
                stamps.len() < 2
            },
            Some(Box::new(move || {
                free_count.fetch_add(1, Ordering::Relaxed);
            })),
        )]);

        for _ in 0..3 {
            h.run_block();
        }
        assert_eq!(*stamps.lock(), vec![128, 256]);

        assert_eq!(freed.load(Ordering::Relaxed), 0);
        h.engine.garbage_collect();
        assert_eq!(freed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn removed_poll_stops_processing() {
        let (engine, mut master) = engine_init(EngineConfig::default()).unwrap();
        let mut lp = EngineLoop::with_capacity(8);
        let fds = vec![PollFd::new(3, 1)];
        let (poll, id) = Job::add_poll(
            &engine,
            fds,
            |_, timeout, _, _| {
                *timeout = Some(std::time::Duration::from_millis(5));
                false
            },
            None,
        )
        .unwrap();

        let mut trans = engine.transaction_open();
        trans.add(poll);
        trans.commit();
        assert!(master.prepare(&mut lp));
        master.dispatch();

        assert!(!master.prepare(&mut lp));
        assert!(lp.fds_changed);
        assert_eq!(lp.fds, vec![PollFd::new(3, 1)]);
        assert_eq!(lp.timeout, Some(std::time::Duration::from_millis(5)));

        let mut trans = engine.transaction_open();
        trans.add(Job::remove_poll(id));
        trans.commit();
        master.dispatch();
        assert!(!master.prepare(&mut lp));
        assert!(lp.fds.is_empty());
        assert_eq!(lp.timeout, None);
    }

    #[test]
    fn tick_stamp_from_systime_scales_by_sample_freq() {
        let mut h = Harness::new();
        h.run_block();

        let now = Instant::now();
        let (stamp, updated) = *h.engine.shared.last_update.lock();
        assert_eq!(stamp, 128);

        let later = updated + std::time::Duration::from_millis(10);
        assert_eq!(h.engine.tick_stamp_from_systime(later), 128 + 480);
        assert!(h.engine.tick_stamp_from_systime(now) >= 128);
    }

    #[test]
    fn master_thread_executes_transactions() {
        let (engine, master) = engine_init(EngineConfig::default()).unwrap();
        let thread = MasterThread::spawn(&engine, master).unwrap();

        let events = Events::default();
        let node = engine.module_new(Recorder {
            value: 0.0,
            events: Arc::clone(&events),
        });
        let m = node.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = Arc::clone(&ran);

        let mut trans = engine.transaction_open();
        trans.add(Job::integrate(node));
        trans.add(Job::access(
            m,
            move |_| {
                ran_in_job.fetch_add(1, Ordering::Relaxed);
            },
            None,
        ));
        trans.commit();
        engine.wait_on_transactions();
        assert_eq!(ran.load(Ordering::Relaxed), 1);

        let master = thread.stop().unwrap();
        assert!(master.node(m.id()).is_some());

        // The master hands remaining nodes back when dropped.
        drop(master);
        engine.garbage_collect();
        assert_eq!(*events.lock(), vec![Event::Free]);
    }

    #[test]
    fn rescheduling_keeps_unscheduled_flow_jobs_visible() {
        let mut h = Harness::new();
        let source = || Recorder {
            value: 0.0,
            events: Events::default(),
        };
        h.integrate(source(), false);
        let s = h.integrate(source(), true);
        let u = h.integrate(source(), false);
        h.run_block();

        // S is scheduled and has a pending flow job of its own. The
        // integration forces a reschedule in the same dispatch.
        let hits = Arc::new(AtomicUsize::new(0));
        let hit = Arc::clone(&hits);
        h.commit(vec![
            Job::flow_access(
                u,
                200,
                move |_| {
                    hit.fetch_add(1, Ordering::Relaxed);
                },
                None,
            ),
            Job::flow_access(s, 1_000_000, |_| {}, None),
            Job::integrate(h.engine.module_new(source())),
        ]);
        for _ in 0..4 {
            h.run_block();
        }

        assert!(h.master.is_scheduled(s.id()));
        assert!(!h.master.is_scheduled(u.id()));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(h.master.node_tick_stamp(u.id()), Some(256));
    }

    #[test]
    fn boundary_access_runs_before_the_block() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();
        events.lock().clear();

        h.commit(vec![Job::boundary_access(
            m,
            300,
            |module| {
                if let Some(recorder) = module.downcast_mut::<Recorder>() {
                    recorder.events.lock().push(Event::Access);
                }
            },
            None,
        )]);
        h.run_block();
        assert_eq!(
            std::mem::take(&mut *events.lock()),
            vec![Event::Process(128, 128)]
        );

        // Due within [256, 384), so it runs at the boundary at 256 without
        // splitting the block.
        h.run_block();
        assert_eq!(
            *events.lock(),
            vec![Event::Access, Event::Process(256, 128)]
        );
    }

    #[test]
    fn boundary_discard_waits_for_the_boundary() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();

        // The access job is committed after the discard, but still finds
        // the node.
        h.commit(vec![
            Job::boundary_discard(m),
            Job::access(
                m,
                |module| {
                    if let Some(recorder) = module.downcast_mut::<Recorder>() {
                        recorder.events.lock().push(Event::Access);
                    }
                },
                None,
            ),
        ]);
        h.master.dispatch();

        assert!(h.master.node(m.id()).is_none());
        assert_eq!(h.master.consumers().count(), 0);
        h.engine.garbage_collect();
        assert_eq!(
            *events.lock(),
            vec![
                Event::Reset,
                Event::Process(0, 128),
                Event::Access,
                Event::Free
            ]
        );
    }

    #[test]
    fn probes_copy_the_processed_block() {
        let mut h = Harness::new();
        let src = h.integrate(
            Recorder {
                value: 0.5,
                events: Events::default(),
            },
            false,
        );
        let sink = h.integrate(Sink(Arc::default()), true);
        let idle = h.integrate(
            Recorder {
                value: 1.0,
                events: Events::default(),
            },
            false,
        );
        h.commit(vec![Job::connect(src, 0, sink, 0).unwrap()]);
        h.run_block();

        let probes = Arc::new(Mutex::new(Vec::new()));
        let probe = |m| {
            let probes = Arc::clone(&probes);
            Job::probe_request(&h.engine, m, move |probe: Probe| {
                let first = probe.ostream(0).map(|values| (values[0], values.len()));
                probes.lock().push((probe.tick_stamp(), first));
            })
        };
        h.commit(vec![probe(src), probe(idle)]);
        h.run_block();
        assert!(probes.lock().is_empty());

        h.engine.garbage_collect();
        // Unscheduled nodes have nothing valid to report.
        assert_eq!(
            *probes.lock(),
            vec![(128, Some((0.5, 128))), (128, None)]
        );
    }

    #[test]
    fn user_callbacks_run_on_garbage_collection() {
        let mut h = Harness::new();
        h.engine.garbage_collect();

        let calls = Arc::new(AtomicUsize::new(0));
        let count = || {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        };
        h.engine.add_user_callback(count());
        h.master.add_user_callback(count());

        assert!(h.engine.has_garbage());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        h.engine.garbage_collect();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(!h.engine.has_garbage());
    }

    #[test]
    fn kill_jobs_sever_connections() {
        let mut h = Harness::new();
        let source = |value| Recorder {
            value,
            events: Events::default(),
        };
        let a = h.integrate(source(1.0), true);
        let b = h.integrate(source(0.5), false);
        let mix = h.integrate(Mixer, false);
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = h.integrate(Sink(Arc::clone(&values)), true);
        h.commit(vec![
            Job::connect(a, 0, mix, 0).unwrap(),
            Job::jconnect(a, 0, mix, 0).unwrap(),
            Job::jconnect(b, 0, mix, 0).unwrap(),
            Job::connect(mix, 0, sink, 0).unwrap(),
        ]);
        h.run_block();
        assert_eq!(h.node(a).fan_out(0), 2);
        assert_eq!(*values.lock(), vec![(2.5, true)]);
        assert_eq!(h.master.consumers().collect::<Vec<_>>(), vec![sink.id()]);

        h.commit(vec![Job::kill_outputs(a)]);
        h.run_block();
        assert_eq!(h.node(a).fan_out(0), 0);
        assert!(!h.node(mix).has_source(0));
        assert_eq!(h.node(mix).jstream_connections(0), 1);
        // Nothing reads from A anymore, so it is a consumer again.
        assert!(h.master.consumers().any(|id| id == a.id()));
        assert!(h.master.is_scheduled(a.id()));
        assert_eq!(values.lock().last(), Some(&(0.5, true)));
        assert!(h.master.fan_out_consistent());

        h.commit(vec![Job::kill_inputs(mix)]);
        h.run_block();
        assert_eq!(h.node(b).fan_out(0), 0);
        assert_eq!(h.node(mix).jstream_connections(0), 0);
        assert!(h.node(sink).has_source(0));
        assert!(!h.master.is_scheduled(b.id()));
        assert!(!h.master.consumers().any(|id| id == b.id()));
        assert_eq!(values.lock().last(), Some(&(0.0, true)));
        assert!(h.master.fan_out_consistent());
    }

    #[test]
    fn force_reset_resets_before_the_next_block() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();
        h.run_block();
        assert_eq!(
            std::mem::take(&mut *events.lock()),
            vec![Event::Reset, Event::Process(0, 128), Event::Process(128, 128)]
        );

        h.commit(vec![Job::force_reset(m)]);
        h.run_block();
        assert_eq!(
            *events.lock(),
            vec![Event::Reset, Event::Process(256, 128)]
        );
    }

    #[test]
    fn unset_consumer_unschedules_the_node() {
        let mut h = Harness::new();
        let events = Events::default();
        let m = h.integrate(
            Recorder {
                value: 0.0,
                events: Arc::clone(&events),
            },
            true,
        );
        h.run_block();
        assert!(h.master.is_scheduled(m.id()));

        h.commit(vec![Job::unset_consumer(m)]);
        h.run_block();
        assert!(!h.master.is_scheduled(m.id()));
        assert_eq!(h.master.consumers().count(), 0);
        assert_eq!(
            *events.lock(),
            vec![Event::Reset, Event::Process(0, 128)]
        );

        h.commit(vec![Job::set_consumer(m)]);
        h.run_block();
        assert!(h.master.is_scheduled(m.id()));
        assert_eq!(events.lock().last(), Some(&Event::Process(256, 128)));
    }

    #[test]
    fn commit_delayed_waits_for_the_stamp() {
        let (engine, master) = engine_init(EngineConfig::default()).unwrap();
        let events = Events::default();
        let node = engine.module_new(Recorder {
            value: 0.0,
            events: Arc::clone(&events),
        });
        let m = node.handle();
        let (poll, _) = Job::add_poll(&engine, Vec::new(), |_, _, _, _| true, None).unwrap();
        let mut trans = engine.transaction_open();
        trans.add(poll);
        trans.add(Job::integrate(node));
        trans.add(Job::set_consumer(m));
        trans.commit();

        let thread = MasterThread::spawn(&engine, master).unwrap();
        engine.wait_on_transactions();

        let target = engine.tick_stamp() + 4 * engine.block_size() as u64;
        let mut trans = engine.transaction_open();
        trans.add(Job::access(
            m,
            |module| {
                if let Some(recorder) = module.downcast_mut::<Recorder>() {
                    recorder.events.lock().push(Event::Access);
                }
            },
            None,
        ));
        trans.commit_delayed(target);
        engine.wait_on_transactions();

        let master = thread.stop().unwrap();
        {
            let events = events.lock();
            let access = events.iter().position(|e| *e == Event::Access).unwrap();
            let processed = events[..access]
                .iter()
                .filter_map(|e| match e {
                    Event::Process(stamp, n_values) => Some(stamp + *n_values as u64),
                    _ => None,
                })
                .max();
            assert!(processed >= Some(target));
        }
        drop(master);
    }

    #[test]
    fn pending_jobs_are_released_without_a_master() {
        let (engine, master) = engine_init(EngineConfig::default()).unwrap();
        drop(master);

        let events = Events::default();
        let node = engine.module_new(Recorder {
            value: 0.0,
            events: Arc::clone(&events),
        });
        let mut trans = engine.transaction_open();
        trans.add(Job::integrate(node));
        trans.commit();

        engine.garbage_collect();
        assert!(events.lock().is_empty());
        drop(engine);
        assert_eq!(*events.lock(), vec![Event::Free]);
    }

    proptest! {
        #[test]
        fn connect_disconnect_restores_fan_out(
            edges in prop::collection::vec((0usize..4, 1usize..4, any::<bool>()), 0..24)
        ) {
            let (engine, mut master) = engine_init(EngineConfig::default()).unwrap();
            let handles: Vec<ModuleHandle> = (0..4)
                .map(|_| {
                    let node = engine.module_new(Mixer);
                    let handle = node.handle();
                    let mut trans = engine.transaction_open();
                    trans.add(Job::integrate(node));
                    trans.commit();
                    handle
                })
                .collect();
            master.dispatch();

            let edges: Vec<_> = edges
                .into_iter()
                .map(|(src, offset, joint)| (handles[src], handles[(src + offset) % 4], joint))
                .collect();

            let mut trans = engine.transaction_open();
            for &(src, dest, joint) in edges.iter() {
                trans.add(if joint {
                    Job::jconnect(src, 0, dest, 0).unwrap()
                } else {
                    Job::connect(src, 0, dest, 0).unwrap()
                });
            }
            trans.commit();
            master.dispatch();
            prop_assert!(master.fan_out_consistent());

            let mut trans = engine.transaction_open();
            for &(src, dest, joint) in edges.iter().rev() {
                trans.add(if joint {
                    Job::jdisconnect(src, 0, dest, 0).unwrap()
                } else {
                    Job::disconnect(dest, 0).unwrap()
                });
            }
            trans.commit();
            master.dispatch();

            prop_assert!(master.fan_out_consistent());
            for handle in handles.iter() {
                let node = master.node(handle.id()).unwrap();
                prop_assert_eq!(node.fan_out(0), 0);
                prop_assert_eq!(node.jstream_connections(0), 0);
                prop_assert!(!node.has_source(0));
            }
        }
    }
}
