use crate::error::{ControlError, ControlResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Single-assignment result cell for operations executed later by the
/// orchestrator's interpreter thread.
///
/// The interpreter completes the cell with `Some(value)` on success or
/// `None` when the command failed; either way the first completion
/// wins and later ones are ignored.
pub struct OpFuture<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Option<Option<T>>>,
    cond: Condvar,
}

impl<T> Clone for OpFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for OpFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OpFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Set the result. A no-op if a result was already set.
    pub fn complete(&self, value: Option<T>) {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.inner.cond.notify_all();
        }
    }

    /// Block until the result is set and return it.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            self.inner.cond.wait(&mut slot);
        }
        slot.as_ref().and_then(|v| v.clone())
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> ControlResult<Option<T>>
    where
        T: Clone,
    {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() && self.inner.cond.wait_for(&mut slot, timeout).timed_out() {
            return Err(ControlError::NotReady);
        }
        match slot.as_ref() {
            Some(v) => Ok(v.clone()),
            None => Err(ControlError::NotReady),
        }
    }

    /// Non-blocking poll; fails with [`ControlError::NotReady`] while
    /// the result is unset.
    pub fn try_get(&self) -> ControlResult<Option<T>>
    where
        T: Clone,
    {
        match self.inner.slot.lock().as_ref() {
            Some(v) => Ok(v.clone()),
            None => Err(ControlError::NotReady),
        }
    }

    /// Whether a result has been set.
    pub fn is_ready(&self) -> bool {
        self.inner.slot.lock().is_some()
    }
}

impl<T> fmt::Debug for OpFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}
