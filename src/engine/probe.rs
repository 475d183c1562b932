use std::fmt;

/// Called in the user thread with the probed output streams of a module.
pub type ProbeFn = Box<dyn FnOnce(Probe) + Send + 'static>;

/// One probed output stream.
struct ProbeStream {
    values: Box<[f32]>,
    connected: bool,
}

/// A copy of the output streams of a module after one processed block.
///
/// Streams that no scheduled node reads do not hold valid data. This is
/// also the case for every stream of a module that was not scheduled, or
/// was discarded before the probe was taken.
pub struct Probe {
    tick_stamp: u64,
    ostreams: Vec<ProbeStream>,
}

impl Probe {
    pub(crate) fn new(n_ostreams: usize, block_size: usize) -> Self {
        Self {
            tick_stamp: 0,
            ostreams: (0..n_ostreams)
                .map(|_| ProbeStream {
                    values: vec![0.0; block_size].into_boxed_slice(),
                    connected: false,
                })
                .collect(),
        }
    }

    /// The tick stamp of the first frame of the probed block.
    pub fn tick_stamp(&self) -> u64 {
        self.tick_stamp
    }

    pub fn n_ostreams(&self) -> usize {
        self.ostreams.len()
    }

    /// The probed values of an output stream, or `None` if they are not
    /// valid.
    pub fn ostream(&self, idx: usize) -> Option<&[f32]> {
        self.ostreams
            .get(idx)
            .filter(|s| s.connected)
            .map(|s| &*s.values)
    }

    pub fn is_connected(&self, idx: usize) -> bool {
        self.ostreams.get(idx).is_some_and(|s| s.connected)
    }

    /// Copy the current contents of the output buffers.
    pub(crate) fn fill<'a>(
        &mut self,
        tick_stamp: u64,
        outputs: impl Iterator<Item = (&'a [f32], bool)>,
    ) {
        self.tick_stamp = tick_stamp;
        for (stream, (values, connected)) in self.ostreams.iter_mut().zip(outputs) {
            stream.connected = connected;
            if connected {
                stream.values.copy_from_slice(values);
            }
        }
    }

    pub(crate) fn mark_taken(&mut self, tick_stamp: u64) {
        self.tick_stamp = tick_stamp;
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("tick_stamp", &self.tick_stamp)
            .field("n_ostreams", &self.ostreams.len())
            .finish()
    }
}

/// A pending probe request, waiting for the end of the next block.
pub(crate) struct ProbeJob {
    pub probe: Probe,
    func: Option<ProbeFn>,
    next: Option<Box<ProbeJob>>,
}

impl ProbeJob {
    pub fn new(probe: Probe, func: ProbeFn) -> Box<Self> {
        Box::new(Self {
            probe,
            func: Some(func),
            next: None,
        })
    }

    /// Hand the probe to its function. Must only be called from the user
    /// thread.
    pub fn release(mut self: Box<Self>) {
        debug_assert!(self.next.is_none());

        if let Some(func) = self.func.take() {
            let probe = std::mem::replace(&mut self.probe, Probe::new(0, 0));
            (func)(probe);
        }
    }
}

/// The per-node stack of pending probe requests.
///
/// Requests queued on the same node are served one per block, in no
/// particular order.
#[derive(Default)]
pub(crate) struct ProbeJobStack {
    head: Option<Box<ProbeJob>>,
}

impl ProbeJobStack {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(&mut self, mut job: Box<ProbeJob>) {
        debug_assert!(job.next.is_none());
        job.next = self.head.take();
        self.head = Some(job);
    }

    pub fn pop(&mut self) -> Option<Box<ProbeJob>> {
        let mut job = self.head.take()?;
        self.head = job.next.take();
        Some(job)
    }
}

impl Drop for ProbeJobStack {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(mut j) = cursor {
            cursor = j.next.take();
        }
    }
}
