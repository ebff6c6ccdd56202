//! Sync Primitives
//!
//! Lock-free cells shared between the owning thread, the decode worker and
//! user threads. Native handles are stored as non-zero integers so that
//! install and release are single atomic swaps.

use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A copyable native handle that round-trips through a non-zero integer.
pub trait RawHandle: Copy + Send + Sync + 'static {
    /// Convert the handle to its raw representation
    fn into_raw(self) -> NonZeroU64;

    /// Rebuild the handle from its raw representation
    fn from_raw(raw: NonZeroU64) -> Self;
}

/// Atomically swappable optional native handle.
///
/// `take` hands the handle to exactly one caller, which makes it the single
/// release point for a native resource even when several threads race to
/// dispose it.
pub struct AtomicHandle<H: RawHandle> {
    raw: AtomicU64,
    _marker: PhantomData<fn() -> H>,
}

impl<H: RawHandle> AtomicHandle<H> {
    /// Create an empty cell
    pub const fn empty() -> Self {
        Self {
            raw: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Create a cell holding the given handle
    pub fn new(handle: Option<H>) -> Self {
        Self {
            raw: AtomicU64::new(Self::encode(handle)),
            _marker: PhantomData,
        }
    }

    fn encode(handle: Option<H>) -> u64 {
        handle.map_or(0, |h| h.into_raw().get())
    }

    fn decode(raw: u64) -> Option<H> {
        NonZeroU64::new(raw).map(H::from_raw)
    }

    /// Read the current handle
    pub fn load(&self) -> Option<H> {
        Self::decode(self.raw.load(Ordering::Acquire))
    }

    /// Replace the handle, returning the previous one
    pub fn swap(&self, handle: Option<H>) -> Option<H> {
        Self::decode(self.raw.swap(Self::encode(handle), Ordering::AcqRel))
    }

    /// Install a handle, returning whatever was there before
    pub fn install(&self, handle: H) -> Option<H> {
        self.swap(Some(handle))
    }

    /// Remove the handle. Only one caller ever observes `Some` for a given install.
    pub fn take(&self) -> Option<H> {
        self.swap(None)
    }

    /// Check whether no handle is installed
    pub fn is_empty(&self) -> bool {
        self.raw.load(Ordering::Acquire) == 0
    }
}

impl<H: RawHandle> Default for AtomicHandle<H> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<H: RawHandle + fmt::Debug> fmt::Debug for AtomicHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicHandle").field(&self.load()).finish()
    }
}

/// `f64` stored in an `AtomicU64`
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// Create a new atomic float
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// Read the value
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Write the value
    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    /// Write the value, returning the previous one
    pub fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.bits.swap(value.to_bits(), Ordering::AcqRel))
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicF64").field(&self.load()).finish()
    }
}
