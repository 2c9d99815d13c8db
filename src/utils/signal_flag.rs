use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheaply clonable one-bit signal shared between a worker and the
/// threads controlling it. Wraps an `AtomicBool` in
/// `Arc<CachePadded<...>>` to avoid false sharing.
#[derive(Clone, Default)]
#[repr(transparent)]
pub struct SignalFlag(Arc<CachePadded<AtomicBool>>);

impl SignalFlag {
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    #[inline(always)]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, v: bool) {
        self.0.store(v, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn raise(&self) {
        self.set(true);
    }

    /// Read the flag and clear it in one step.
    #[inline(always)]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

impl fmt::Debug for SignalFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFlag").field("value", &self.get()).finish()
    }
}
