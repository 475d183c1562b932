use std::{any::Any, ops::Range};

use crate::engine::{const_values::ConstValueCache, node::Output};

/// Access to the concrete type behind a `dyn Module`.
///
/// Implemented for every `'static` type, so modules never implement it
/// themselves.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A unit of signal processing that the engine drives
///
/// Implementers are supplied by DSP authors. The engine only ever calls
/// these methods from the realtime thread, except for [`Module::free`]
/// which always runs in the user thread during garbage collection.
pub trait Module: AsAny + Send {
    /// Get the stream layout and cost hints of this module.
    ///
    /// This method will only be called once, when the module is wrapped
    /// into an [`EngineNode`](crate::EngineNode).
    fn class(&self) -> ModuleClass;

    /// Process `n_values` frames.
    ///
    /// `n_values` may be smaller than the block size when a flow job or a
    /// suspension change splits the block.
    fn process(&mut self, cx: &mut ProcessContext<'_>, n_values: usize);

    /// Called once before the next [`Module::process`] after the module
    /// was integrated, resumed, or explicitly reset.
    fn reset(&mut self) {}

    /// Called in the user thread right before the module is dropped.
    fn free(&mut self) {}
}

impl<'a> dyn Module + 'a {
    /// Returns `true` if the concrete type of this module is `T`.
    pub fn is<T: Module>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to the concrete module type, mainly for access jobs.
    pub fn downcast_mut<T: Module>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn downcast_ref<T: Module>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// The fixed stream layout of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleClass {
    /// The number of single-connection input streams.
    pub n_istreams: u16,
    /// The number of joint input streams. Each of these accepts any
    /// number of connections.
    pub n_jstreams: u16,
    /// The number of output streams.
    pub n_ostreams: u16,
    pub flags: ModuleFlags,
}

impl ModuleClass {
    pub const fn new(n_istreams: u16, n_ostreams: u16) -> Self {
        Self {
            n_istreams,
            n_jstreams: 0,
            n_ostreams,
            flags: ModuleFlags::NONE,
        }
    }

    pub const fn with_jstreams(mut self, n_jstreams: u16) -> Self {
        self.n_jstreams = n_jstreams;
        self
    }

    pub const fn with_flags(mut self, flags: ModuleFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Cost and capability hints of a module.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleFlags(u8);

impl ModuleFlags {
    pub const NONE: Self = Self(0);
    /// Processing is costly, schedule this module early within its
    /// leaf level.
    pub const EXPENSIVE: Self = Self(1 << 0);
    /// Processing is trivial.
    pub const CHEAP: Self = Self(1 << 1);
    /// The module can produce its output before its input for the same
    /// block is available. Cycles are only schedulable through such a
    /// module.
    pub const DELAY: Self = Self(1 << 2);

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ModuleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// The index of an input stream on a particular module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IStreamIdx(pub u16);

impl From<u16> for IStreamIdx {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// The index of a joint input stream on a particular module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JStreamIdx(pub u16);

impl From<u16> for JStreamIdx {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// The index of an output stream on a particular module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OStreamIdx(pub u16);

impl From<u16> for OStreamIdx {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// A readable input stream.
#[derive(Debug, Clone, Copy)]
pub struct IStream<'a> {
    pub values: &'a [f32],
    pub connected: bool,
}

/// The buffers and services available to a module during
/// [`Module::process`].
pub struct ProcessContext<'a> {
    pub(crate) istreams: &'a [IStream<'a>],
    pub(crate) jvalues: &'a [&'a [f32]],
    pub(crate) jranges: &'a [Range<usize>],
    pub(crate) outputs: &'a mut [Output],
    pub(crate) offset: usize,
    pub(crate) n_values: usize,
    pub(crate) tick_stamp: u64,
    pub(crate) const_values: &'a mut ConstValueCache,
}

impl<'a> ProcessContext<'a> {
    /// The number of frames requested by this call.
    pub fn n_values(&self) -> usize {
        self.n_values
    }

    /// The tick stamp of the first frame of this call.
    pub fn tick_stamp(&self) -> u64 {
        self.tick_stamp
    }

    /// The values of an input stream. Unconnected inputs read zeros.
    pub fn istream(&self, idx: impl Into<IStreamIdx>) -> &[f32] {
        self.istreams[usize::from(idx.into().0)].values
    }

    pub fn istream_connected(&self, idx: impl Into<IStreamIdx>) -> bool {
        self.istreams[usize::from(idx.into().0)].connected
    }

    /// The values of every live connection of a joint input stream.
    pub fn jstream(&self, idx: impl Into<JStreamIdx>) -> &[&'a [f32]] {
        let range = self.jranges[usize::from(idx.into().0)].clone();
        &self.jvalues[range]
    }

    /// The output buffer of a stream, `n_values` frames long.
    pub fn ostream(&mut self, idx: impl Into<OStreamIdx>) -> &mut [f32] {
        let output = &mut self.outputs[usize::from(idx.into().0)];
        &mut output.buffer[self.offset..self.offset + self.n_values]
    }

    /// Whether any scheduled node reads this output stream.
    pub fn ostream_connected(&self, idx: impl Into<OStreamIdx>) -> bool {
        self.outputs[usize::from(idx.into().0)].connected
    }

    /// A shared read-only block filled with `value`.
    ///
    /// The returned block is at least `n_values` frames long and stays
    /// valid for a few blocks after its last request.
    pub fn const_values(&mut self, value: f32) -> &[f32] {
        &self.const_values.get_const_block(value)[..self.n_values]
    }
}
