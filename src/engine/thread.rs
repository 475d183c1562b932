use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use super::{master::EngineMaster, poll::EngineLoop, Engine, Shared};

/// Runs an [`EngineMaster`] on a dedicated thread.
///
/// The thread sleeps until a transaction is committed or a poll function
/// timeout expires. File descriptors requested by poll functions are not
/// waited on; embedders that need them drive [`EngineMaster::prepare`],
/// [`EngineMaster::check`] and [`EngineMaster::dispatch`] themselves.
pub struct MasterThread {
    handle: Option<JoinHandle<EngineMaster>>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl MasterThread {
    pub fn spawn(engine: &Engine, mut master: EngineMaster) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let max_poll_fds = master.config().max_poll_fds;

        let handle = {
            let stop = Arc::clone(&stop);
            let shared = Arc::clone(&engine.shared);
            thread::Builder::new()
                .name("flow-engine-master".into())
                .spawn(move || {
                    *shared.wakeup.lock() = Some(thread::current());
                    log::debug!("master thread started");

                    let mut lp = EngineLoop::with_capacity(max_poll_fds);
                    while !stop.load(Ordering::Acquire) {
                        let mut need_dispatch = master.prepare(&mut lp);
                        if !need_dispatch {
                            match lp.timeout {
                                Some(timeout) => thread::park_timeout(timeout),
                                None => thread::park(),
                            }
                            need_dispatch = master.check(&mut lp);
                        }
                        if need_dispatch {
                            master.dispatch();
                        }
                    }

                    *shared.wakeup.lock() = None;
                    log::debug!("master thread stopped");
                    master
                })?
        };

        Ok(Self {
            handle: Some(handle),
            stop,
            shared: Arc::clone(&engine.shared),
        })
    }

    /// Stop the thread and take back the master.
    ///
    /// Returns `None` if the thread panicked.
    pub fn stop(mut self) -> Option<EngineMaster> {
        self.join()
    }

    fn join(&mut self) -> Option<EngineMaster> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();

        match handle.join() {
            Ok(master) => Some(master),
            Err(_) => {
                log::error!("master thread panicked");
                *self.shared.wakeup.lock() = None;
                None
            }
        }
    }
}

impl Drop for MasterThread {
    fn drop(&mut self) {
        self.join();
    }
}
