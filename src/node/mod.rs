pub use state::{ControlRequest, ControlState};

mod state;

use crate::config::{clamp_frequency, DEFAULT_FREQUENCY};
use crate::error::{ControlError, ControlResult};
use crate::utils::{SignalFlag, SuspensionCell, SuspensionPoint};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Capability a parent container hands to its children: resolve the
/// parent's core and detach a child on request. Implemented by owning
/// containers only, never exposed outside the crate.
pub(crate) trait ParentOps: Send + Sync {
    fn parent_core(&self) -> &Arc<NodeCore>;
    /// Remove `child` from the container, clearing its parent pointer.
    /// Returns false when the child is not a member.
    fn detach_child(&self, child: &Arc<NodeCore>) -> bool;
}

/// Back-pointer from an adopted node to its owning container.
pub(crate) struct ParentLink {
    pub(crate) name: Arc<str>,
    pub(crate) ops: Weak<dyn ParentOps>,
}

impl ParentLink {
    pub(crate) fn new(name: Arc<str>, ops: Weak<dyn ParentOps>) -> Self {
        Self { name, ops }
    }
}

pub(crate) struct NodeInner {
    pub(crate) state: ControlState,
}

struct WorkerSlot {
    started: bool,
    join: Option<JoinHandle<()>>,
}

/// Shared control block of every node: guarded lifecycle state, a
/// lock-free mirror of it, the effective frequency, the parent
/// back-pointer and the worker thread bookkeeping.
///
/// All transitions funnel through [`apply`](Self::apply) under the
/// node lock; observers read the atomic mirror without locking.
pub struct NodeCore {
    name: Arc<str>,
    inner: Mutex<NodeInner>,
    conds: RwLock<Vec<Arc<Condvar>>>,
    state_cell: AtomicU8,
    freq: AtomicU64,
    inherit_rate: AtomicBool,
    awaited: AtomicBool,
    parent: ArcSwapOption<ParentLink>,
    interrupt: SignalFlag,
    suspension: SuspensionCell,
    worker: Mutex<WorkerSlot>,
}

impl NodeCore {
    pub(crate) fn new(name: &str, frequency: u64, inherit_rate: bool) -> ControlResult<Arc<Self>> {
        if name.is_empty() {
            return Err(ControlError::NullArgument("name"));
        }
        Ok(Arc::new(Self {
            name: Arc::from(name),
            inner: Mutex::new(NodeInner {
                state: ControlState::New,
            }),
            conds: RwLock::new(vec![Arc::new(Condvar::new())]),
            state_cell: AtomicU8::new(ControlState::New as u8),
            freq: AtomicU64::new(clamp_frequency(frequency)),
            inherit_rate: AtomicBool::new(inherit_rate),
            awaited: AtomicBool::new(false),
            parent: ArcSwapOption::from(None),
            interrupt: SignalFlag::new(false),
            suspension: SuspensionCell::new(),
            worker: Mutex::new(WorkerSlot {
                started: false,
                join: None,
            }),
        }))
    }

    pub(crate) fn with_default_frequency(name: &str) -> ControlResult<Arc<Self>> {
        Self::new(name, DEFAULT_FREQUENCY, true)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Current state, read without taking the node lock.
    #[inline]
    pub fn state(&self) -> ControlState {
        ControlState::from_u8(self.state_cell.load(Ordering::Acquire))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock()
    }

    /// Validate and perform a control transition. On success the new
    /// state is published and the node condition is signalled so a
    /// blocked worker re-evaluates it.
    pub(crate) fn apply(&self, request: ControlRequest) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        if !request.allowed_from(inner.state) {
            return Err(ControlError::InvalidTransition {
                node: self.path(),
                state: inner.state.as_str(),
            });
        }
        // Latched before the new state is published so a pacing sleep
        // in flight ends on this transition.
        self.interrupt.raise();
        self.store_state(&mut inner, request.target());
        Ok(())
    }

    /// Overwrite the state while the caller already holds the node
    /// lock. Used by workers forcing themselves into `Shutdown`.
    pub(crate) fn store_state(&self, inner: &mut NodeInner, state: ControlState) {
        inner.state = state;
        self.state_cell.store(state as u8, Ordering::Release);
        self.condition(0).notify_one();
    }

    /// Effective frequency: the parent's while inheritance is on and a
    /// parent is reachable, the node's own value otherwise.
    pub fn frequency(&self) -> u64 {
        if self.inherit_rate.load(Ordering::Relaxed) {
            if let Some(link) = self.parent.load_full() {
                if let Some(ops) = link.ops.upgrade() {
                    return ops.parent_core().frequency();
                }
            }
        }
        self.freq.load(Ordering::Relaxed)
    }

    /// Set an explicit local frequency, which also switches rate
    /// inheritance off.
    pub fn set_frequency(&self, frequency: u64) {
        self.freq.store(clamp_frequency(frequency), Ordering::Relaxed);
        self.inherit_rate.store(false, Ordering::Relaxed);
    }

    pub fn inherit_rate(&self) -> bool {
        self.inherit_rate.load(Ordering::Relaxed)
    }

    pub fn set_inherit_rate(&self, inherit: bool) {
        self.inherit_rate.store(inherit, Ordering::Relaxed);
    }

    /// Copy the parent's current frequency into the local slot so the
    /// node keeps its last observed rate if it is later detached.
    pub(crate) fn resync_inherited_rate(&self) {
        if self.inherit_rate.load(Ordering::Relaxed) && self.parent.load().is_some() {
            self.freq.store(self.frequency(), Ordering::Relaxed);
        }
    }

    pub fn await_on_shutdown(&self) -> bool {
        self.awaited.load(Ordering::Relaxed)
    }

    pub fn set_await_on_shutdown(&self, awaited: bool) {
        self.awaited.store(awaited, Ordering::Relaxed);
    }

    /// One-shot adoption by a parent container. Fails while another
    /// parent is still attached.
    pub(crate) fn adopt(&self, link: ParentLink) -> ControlResult<()> {
        let _guard = self.inner.lock();
        if let Some(existing) = self.parent.load_full() {
            return Err(ControlError::AlreadyOwned {
                node: self.name.to_string(),
                parent: existing.name.to_string(),
            });
        }
        self.parent.store(Some(Arc::new(link)));
        Ok(())
    }

    pub(crate) fn clear_parent(&self) {
        let _guard = self.inner.lock();
        self.parent.store(None);
    }

    pub(crate) fn parent(&self) -> Option<Arc<ParentLink>> {
        self.parent.load_full()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.load().is_some()
    }

    pub fn parent_name(&self) -> Option<String> {
        self.parent.load_full().map(|link| link.name.to_string())
    }

    /// Dot-separated ancestry path, e.g. `orchestrator.default.pump`.
    pub fn path(&self) -> String {
        match self.parent.load_full() {
            Some(link) => match link.ops.upgrade() {
                Some(ops) => format!("{}.{}", ops.parent_core().path(), self.name),
                None => format!("{}.{}", link.name, self.name),
            },
            None => self.name.to_string(),
        }
    }

    /// Node-local condition by index; the vector grows on demand and
    /// index 0 always exists.
    pub(crate) fn condition(&self, index: usize) -> Arc<Condvar> {
        {
            let conds = self.conds.read();
            if let Some(cond) = conds.get(index) {
                return cond.clone();
            }
        }
        let mut conds = self.conds.write();
        while conds.len() <= index {
            conds.push(Arc::new(Condvar::new()));
        }
        conds[index].clone()
    }

    pub(crate) fn interrupt(&self) -> &SignalFlag {
        &self.interrupt
    }

    pub(crate) fn suspension_cell(&self) -> &SuspensionCell {
        &self.suspension
    }

    pub fn suspension(&self) -> SuspensionPoint {
        self.suspension.get()
    }

    /// Spawn the node's worker thread exactly once. Later calls are
    /// no-ops returning false.
    pub(crate) fn spawn_worker<F>(&self, thread_name: String, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.worker.lock();
        if slot.started {
            return false;
        }
        match std::thread::Builder::new().name(thread_name).spawn(f) {
            Ok(handle) => {
                slot.started = true;
                slot.join = Some(handle);
                true
            }
            Err(err) => {
                tracing::error!("[Node] '{}' failed to spawn worker: {err}", self.name);
                false
            }
        }
    }

    pub(crate) fn worker_started(&self) -> bool {
        self.worker.lock().started
    }

    /// Wait for the worker thread to exit. Safe to call from several
    /// threads; only the first caller actually joins.
    pub fn join(&self) {
        let handle = self.worker.lock().join.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("[Node] '{}' worker terminated by panic", self.name);
            }
        }
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("path", &self.path())
            .field("state", &self.state())
            .field("frequency", &self.frequency())
            .finish()
    }
}

impl fmt::Display for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Common surface of every control node. Implementors decide how a
/// request also affects their worker (lazy start, interrupting a
/// pacing sleep); the state transition itself always goes through the
/// shared [`NodeCore`].
pub trait Node: Send + Sync {
    fn core(&self) -> &Arc<NodeCore>;

    fn request_execute(&self) -> ControlResult<()>;
    fn request_pause(&self) -> ControlResult<()>;
    fn request_stop(&self) -> ControlResult<()>;
    fn request_shutdown(&self) -> ControlResult<()>;

    fn request(&self, request: ControlRequest) -> ControlResult<()> {
        match request {
            ControlRequest::Execute => self.request_execute(),
            ControlRequest::Pause => self.request_pause(),
            ControlRequest::Stop => self.request_stop(),
            ControlRequest::Shutdown => self.request_shutdown(),
        }
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn path(&self) -> String {
        self.core().path()
    }

    fn state(&self) -> ControlState {
        self.core().state()
    }

    fn frequency(&self) -> u64 {
        self.core().frequency()
    }

    fn set_frequency(&self, frequency: u64) {
        self.core().set_frequency(frequency);
    }

    fn set_inherit_rate(&self, inherit: bool) {
        self.core().set_inherit_rate(inherit);
    }

    fn await_on_shutdown(&self) -> bool {
        self.core().await_on_shutdown()
    }

    fn set_await_on_shutdown(&self, awaited: bool) {
        self.core().set_await_on_shutdown(awaited);
    }

    fn suspension(&self) -> SuspensionPoint {
        self.core().suspension()
    }

    fn join(&self) {
        self.core().join();
    }
}

/// Identity comparison by control block, not by handle address.
pub fn same_node(a: &dyn Node, b: &dyn Node) -> bool {
    Arc::ptr_eq(a.core(), b.core())
}
