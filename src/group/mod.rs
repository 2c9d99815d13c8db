use crate::error::{ControlError, ControlResult};
use crate::node::{ControlRequest, ControlState, Node, NodeCore, ParentLink, ParentOps};
use crate::utils::SuspensionPoint;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Upper bound on how long the supervisor sleeps between sweeps when
/// nothing wakes it earlier.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct KidsInner {
    items: Vec<Arc<dyn Node>>,
    generation: u64,
}

/// Child list shared between a group handle and its worker. Every
/// structural change bumps the generation so an in-flight sweep knows
/// to restart from a fresh snapshot.
struct Kids {
    inner: Mutex<KidsInner>,
}

impl Kids {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(KidsInner {
                items: Vec::new(),
                generation: 0,
            }),
        })
    }

    fn snapshot(&self) -> (Vec<Arc<dyn Node>>, u64) {
        let inner = self.inner.lock();
        (inner.items.clone(), inner.generation)
    }

    fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    fn contains(&self, core: &Arc<NodeCore>) -> bool {
        self.inner
            .lock()
            .items
            .iter()
            .any(|n| Arc::ptr_eq(n.core(), core))
    }

    fn attach(&self, node: Arc<dyn Node>) {
        let mut inner = self.inner.lock();
        inner.items.push(node);
        inner.generation += 1;
    }

    fn detach(&self, core: &Arc<NodeCore>) -> Option<Arc<dyn Node>> {
        let mut inner = self.inner.lock();
        let pos = inner
            .items
            .iter()
            .position(|n| Arc::ptr_eq(n.core(), core))?;
        let node = inner.items.remove(pos);
        inner.generation += 1;
        node.core().clear_parent();
        Some(node)
    }

    fn detach_all(&self) -> Vec<Arc<dyn Node>> {
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut inner.items);
        inner.generation += 1;
        for node in &drained {
            node.core().clear_parent();
        }
        drained
    }
}

/// Supervising node that cascades its own control state onto a list
/// of children once per sweep. Children that reach `Shutdown` on
/// their own are detached by the sweep; children added at runtime are
/// steered toward the group's state on the next pass.
pub struct Group {
    core: Arc<NodeCore>,
    kids: Arc<Kids>,
    this: Weak<Group>,
}

impl Group {
    pub fn new(name: &str) -> ControlResult<Arc<Self>> {
        let core = NodeCore::with_default_frequency(name)?;
        Ok(Arc::new_cyclic(|this| Self {
            core,
            kids: Kids::new(),
            this: this.clone(),
        }))
    }

    /// Adopt `node` as a child. A node owned by another group is
    /// detached from it first; the group's state is imposed on the
    /// newcomer by the next sweep rather than immediately.
    ///
    /// Returns false without touching anything when either side is
    /// already `Shutdown` or the node is already a member.
    pub fn add(&self, node: Arc<dyn Node>) -> ControlResult<bool> {
        if self.core.state() == ControlState::Shutdown || node.state() == ControlState::Shutdown {
            return Ok(false);
        }
        if self.kids.contains(node.core()) {
            return Ok(false);
        }
        if let Some(link) = node.core().parent() {
            match link.ops.upgrade() {
                Some(ops) => {
                    if Arc::ptr_eq(ops.parent_core(), &self.core) {
                        return Ok(false);
                    }
                    if !ops.detach_child(node.core()) && node.core().has_parent() {
                        return Err(ControlError::AlreadyOwned {
                            node: node.name().to_string(),
                            parent: link.name.to_string(),
                        });
                    }
                }
                // The owner is gone; the stale back-pointer can go too.
                None => node.core().clear_parent(),
            }
        }

        let ops: Weak<dyn ParentOps> = self.this.clone();
        node.core()
            .adopt(ParentLink::new(self.core.name_arc(), ops))?;
        self.kids.attach(node);
        self.core.condition(0).notify_one();
        Ok(true)
    }

    /// Adopt every node in `nodes`, skipping the ones that fail.
    /// Returns how many were actually added.
    pub fn add_all(&self, nodes: Vec<Arc<dyn Node>>) -> usize {
        let mut added = 0;
        for node in nodes {
            let name = node.name().to_string();
            match self.add(node) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("[Group] '{}' could not add '{name}': {err}", self.core.path());
                }
            }
        }
        added
    }

    /// Detach `node`, clearing its parent pointer. Returns the node
    /// when it was a member.
    pub fn remove(&self, node: &dyn Node) -> Option<Arc<dyn Node>> {
        self.kids.detach(node.core())
    }

    /// Detach every child at once.
    pub fn remove_all(&self) -> Vec<Arc<dyn Node>> {
        self.kids.detach_all()
    }

    pub fn contains(&self, node: &dyn Node) -> bool {
        self.kids.contains(node.core())
    }

    pub fn len(&self) -> usize {
        self.kids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current children.
    pub fn children(&self) -> Vec<Arc<dyn Node>> {
        self.kids.snapshot().0
    }

    fn ensure_started(&self) {
        let core = self.core.clone();
        let kids = self.kids.clone();
        let thread_name = format!("cyclert.{}", self.core.name());
        self.core
            .spawn_worker(thread_name, move || group_worker(core, kids));
    }
}

impl ParentOps for Group {
    fn parent_core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    fn detach_child(&self, child: &Arc<NodeCore>) -> bool {
        self.kids.detach(child).is_some()
    }
}

impl Node for Group {
    fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    fn request_execute(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Execute)?;
        self.ensure_started();
        Ok(())
    }

    fn request_pause(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Pause)?;
        self.ensure_started();
        Ok(())
    }

    fn request_stop(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Stop)?;
        self.ensure_started();
        Ok(())
    }

    fn request_shutdown(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Shutdown)?;
        self.ensure_started();
        Ok(())
    }

    /// An explicit group rate also refreshes what inheriting children
    /// fall back to if they are later detached.
    fn set_frequency(&self, frequency: u64) {
        self.core.set_frequency(frequency);
        for child in self.children() {
            child.core().resync_inherited_rate();
        }
    }

    /// Propagates recursively through nested groups.
    fn set_await_on_shutdown(&self, awaited: bool) {
        self.core.set_await_on_shutdown(awaited);
        for child in self.children() {
            child.set_await_on_shutdown(awaited);
        }
    }
}

fn group_worker(core: Arc<NodeCore>, kids: Arc<Kids>) {
    let cond = core.condition(0);
    let suspension = core.suspension_cell().clone();
    let mut guard = core.lock();
    loop {
        if guard.state != ControlState::Shutdown {
            suspension.set(SuspensionPoint::SweepWait);
            let _ = cond.wait_for(&mut guard, SWEEP_INTERVAL);
            suspension.set(SuspensionPoint::Running);
        }
        let state = guard.state;
        MutexGuard::unlocked(&mut guard, || sweep(&core, &kids, state));
        if state == ControlState::Shutdown {
            break;
        }
    }
    drop(guard);
    suspension.set(SuspensionPoint::Exited);
    tracing::debug!("[Group] '{}' worker exited", core.path());
}

/// One cascade pass over the children. Runs without the group lock so
/// a child transition can never wait on this group. A structural
/// change observed mid-walk restarts the pass from a fresh snapshot.
fn sweep(core: &Arc<NodeCore>, kids: &Kids, state: ControlState) {
    use ControlState::*;
    loop {
        let (snapshot, mut gen) = kids.snapshot();
        let mut restart = false;
        for child in snapshot {
            if kids.generation() != gen {
                restart = true;
                break;
            }
            let child_state = child.state();
            if child_state == Shutdown {
                if kids.detach(child.core()).is_some() {
                    tracing::debug!(
                        "[Group] '{}' detached finished '{}'",
                        core.path(),
                        child.name()
                    );
                    gen = kids.generation();
                }
                continue;
            }
            let request = match state {
                New => matches!(child_state, Executing | Paused).then(|| child.request_stop()),
                Executing => (child_state != Executing).then(|| child.request_execute()),
                Paused => {
                    matches!(child_state, New | Executing).then(|| child.request_pause())
                }
                Stopped => (child_state != Stopped).then(|| child.request_stop()),
                Shutdown => Some(child.request_shutdown()),
            };
            if let Some(Err(err)) = request {
                tracing::trace!(
                    "[Group] '{}' cascade to '{}' skipped: {err}",
                    core.path(),
                    child.name()
                );
            }
        }
        if !restart {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{Routine, RoutineCtl, RoutineModel};
    use std::time::Instant;

    struct Idle;

    impl RoutineModel for Idle {
        fn execute(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn wait_until(what: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        what()
    }

    fn leaf(name: &str) -> Arc<dyn Node> {
        Routine::new(name, Idle).unwrap()
    }

    #[test]
    fn add_adopts_and_rejects_duplicates() {
        let group = Group::new("g").unwrap();
        let node = leaf("a");

        assert!(group.add(node.clone()).unwrap());
        assert!(group.contains(node.as_ref()));
        assert_eq!(group.len(), 1);
        assert_eq!(node.core().parent_name().as_deref(), Some("g"));
        assert_eq!(node.path(), "g.a");

        assert!(!group.add(node.clone()).unwrap());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn add_steals_from_the_previous_group() {
        let first = Group::new("first").unwrap();
        let second = Group::new("second").unwrap();
        let node = leaf("n");

        assert!(first.add(node.clone()).unwrap());
        assert!(second.add(node.clone()).unwrap());

        assert_eq!(first.len(), 0);
        assert!(second.contains(node.as_ref()));
        assert_eq!(node.core().parent_name().as_deref(), Some("second"));
    }

    #[test]
    fn remove_clears_the_parent() {
        let group = Group::new("g").unwrap();
        let node = leaf("a");
        group.add(node.clone()).unwrap();

        let removed = group.remove(node.as_ref()).unwrap();
        assert!(crate::node::same_node(removed.as_ref(), node.as_ref()));
        assert!(!node.core().has_parent());
        assert!(group.remove(node.as_ref()).is_none());
    }

    #[test]
    fn shutdown_members_are_not_addable() {
        let group = Group::new("g").unwrap();
        let node = leaf("a");
        node.request_shutdown().unwrap();
        node.join();
        assert!(!group.add(node).unwrap());
        assert_eq!(group.len(), 0);
    }

    #[test]
    fn frequency_propagates_to_inheriting_children_only() {
        let group = Group::new("g").unwrap();
        let inheriting = leaf("a");
        let pinned = leaf("b");
        pinned.set_frequency(30);
        group.add(inheriting.clone()).unwrap();
        group.add(pinned.clone()).unwrap();

        group.set_frequency(100);
        assert_eq!(inheriting.frequency(), 100);
        assert_eq!(pinned.frequency(), 30);
    }

    #[test]
    fn await_on_shutdown_propagates_recursively() {
        let outer = Group::new("outer").unwrap();
        let inner = Group::new("inner").unwrap();
        let node = leaf("a");
        inner.add(node.clone()).unwrap();
        let inner_dyn: Arc<dyn Node> = inner.clone();
        outer.add(inner_dyn).unwrap();

        outer.set_await_on_shutdown(true);
        assert!(inner.await_on_shutdown());
        assert!(node.await_on_shutdown());
    }

    #[test]
    fn cascade_drives_children_through_the_lifecycle() {
        let group = Group::new("crew").unwrap();
        group.set_frequency(200);
        let a = leaf("a");
        let b = leaf("b");
        group.add(a.clone()).unwrap();
        group.add(b.clone()).unwrap();

        group.request_execute().unwrap();
        assert!(wait_until(
            || a.state() == ControlState::Executing && b.state() == ControlState::Executing,
            Duration::from_secs(3)
        ));

        group.request_pause().unwrap();
        assert!(wait_until(
            || a.state() == ControlState::Paused && b.state() == ControlState::Paused,
            Duration::from_secs(3)
        ));

        group.request_stop().unwrap();
        assert!(wait_until(
            || a.state() == ControlState::Stopped && b.state() == ControlState::Stopped,
            Duration::from_secs(3)
        ));

        group.request_shutdown().unwrap();
        group.join();
        assert!(wait_until(
            || a.state() == ControlState::Shutdown && b.state() == ControlState::Shutdown,
            Duration::from_secs(3)
        ));
        a.join();
        b.join();
    }

    #[test]
    fn late_joiner_is_steered_to_the_group_state() {
        let group = Group::new("late").unwrap();
        group.set_frequency(200);
        group.request_execute().unwrap();

        let node = leaf("n");
        group.add(node.clone()).unwrap();
        assert!(wait_until(
            || node.state() == ControlState::Executing,
            Duration::from_secs(3)
        ));

        group.request_shutdown().unwrap();
        group.join();
        node.join();
    }

    #[test]
    fn self_shutdown_child_is_detached_by_the_sweep() {
        struct OneShot;
        impl RoutineModel for OneShot {
            fn execute(&mut self, ctl: &RoutineCtl) -> anyhow::Result<()> {
                ctl.request_shutdown()?;
                Ok(())
            }
        }

        let group = Group::new("reaper").unwrap();
        group.set_frequency(200);
        let node: Arc<dyn Node> = Routine::new("oneshot", OneShot).unwrap();
        group.add(node.clone()).unwrap();

        group.request_execute().unwrap();
        assert!(wait_until(|| group.len() == 0, Duration::from_secs(3)));
        assert!(!node.core().has_parent());

        group.request_shutdown().unwrap();
        group.join();
        node.join();
    }
}
