pub(crate) mod command;

use crate::config::{clamp_frequency, OrchestratorConfig, DEFAULT_FREQUENCY};
use crate::error::{ControlError, ControlResult};
use crate::future::OpFuture;
use crate::group::Group;
use crate::manager::command::Command;
use crate::node::{ControlRequest, ControlState, Node, NodeCore, ParentLink, ParentOps};
use crate::routine::Routine;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use regex::Regex;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

/// Name of the group that plain leaf registration lands in.
pub const DEFAULT_GROUP: &str = "default";

const DEFAULT_QUEUE_POLL_MS: u64 = 100;
const DEFAULT_SWEEP_MS: u64 = 500;

/// Registry of groups directly owned by an orchestrator. Doubles as
/// the parent capability those groups point back at.
struct ManagedSet {
    core: Arc<NodeCore>,
    groups: Mutex<Vec<Arc<Group>>>,
    this: Weak<ManagedSet>,
}

impl ManagedSet {
    fn attach(&self, group: Arc<Group>) -> ControlResult<()> {
        let ops: Weak<dyn ParentOps> = self.this.clone();
        group
            .core()
            .adopt(ParentLink::new(self.core.name_arc(), ops))?;
        self.groups.lock().push(group);
        Ok(())
    }

    fn find(&self, name: &str) -> Option<Arc<Group>> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.name() == name)
            .cloned()
    }

    fn contains(&self, group: &Group) -> bool {
        self.groups
            .lock()
            .iter()
            .any(|g| Arc::ptr_eq(g.core(), group.core()))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.groups.lock().iter().any(|g| g.name() == name)
    }

    fn list(&self) -> Vec<Arc<Group>> {
        self.groups.lock().clone()
    }

    fn remove(&self, core: &Arc<NodeCore>) -> Option<Arc<Group>> {
        let mut groups = self.groups.lock();
        let pos = groups.iter().position(|g| Arc::ptr_eq(g.core(), core))?;
        let group = groups.remove(pos);
        group.core().clear_parent();
        Some(group)
    }

    /// Drop groups that reached `Shutdown` on their own.
    fn sweep(&self) {
        let mut groups = self.groups.lock();
        groups.retain(|g| {
            if g.state() == ControlState::Shutdown {
                g.core().clear_parent();
                tracing::debug!("[Orchestrator] dropped finished group '{}'", g.name());
                false
            } else {
                true
            }
        });
    }
}

impl ParentOps for ManagedSet {
    fn parent_core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    fn detach_child(&self, child: &Arc<NodeCore>) -> bool {
        self.remove(child).is_some()
    }
}

struct ManagerInner {
    core: Arc<NodeCore>,
    cmd_tx: Sender<Command>,
    track_tx: Sender<Arc<dyn Node>>,
    registry: Mutex<Vec<Arc<dyn Node>>>,
    managed: Arc<ManagedSet>,
    queue_poll: Duration,
    sweep_interval: Duration,
    over: AtomicBool,
    exit_started: AtomicBool,
    terminated: AtomicBool,
    exit_done: OpFuture<()>,
    term_signal: Option<Arc<AtomicBool>>,
    log_guard: Mutex<Option<WorkerGuard>>,
    sweep_join: Mutex<Option<JoinHandle<()>>>,
    interp_join: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn track(&self, node: Arc<dyn Node>) {
        let _ = self.track_tx.send(node);
    }

    fn absorb(&self, node: Arc<dyn Node>) {
        let mut registry = self.registry.lock();
        if !registry.iter().any(|n| Arc::ptr_eq(n.core(), node.core())) {
            registry.push(node);
        }
    }
}

/// Asynchronous control center. Owns an interpreter thread that
/// executes queued commands, a sweeper that forgets finished nodes,
/// and a `default` group for leaves registered without a group.
///
/// Handles are cheap clones of one shared instance; several
/// orchestrators can coexist in one process. After [`exit`](Self::exit)
/// completes every entry point fails with
/// [`ControlError::Unavailable`].
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<ManagerInner>,
}

impl Orchestrator {
    pub fn spawn(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| "orchestrator".to_string());
        let core = NodeCore::new(
            &name,
            config.frequency.unwrap_or(DEFAULT_FREQUENCY),
            false,
        )?;

        let log_guard = match &config.logger {
            Some(logger) => logger.init()?,
            None => None,
        };

        let (cmd_tx, cmd_rx) = unbounded();
        let (track_tx, track_rx) = unbounded();

        let term_signal = if config.handle_term_signals {
            let flag = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(SIGTERM, flag.clone())?;
            signal_hook::flag::register(SIGINT, flag.clone())?;
            Some(flag)
        } else {
            None
        };

        let inner = Arc::new(ManagerInner {
            managed: Arc::new_cyclic(|this| ManagedSet {
                core: core.clone(),
                groups: Mutex::new(Vec::new()),
                this: this.clone(),
            }),
            core,
            cmd_tx,
            track_tx,
            registry: Mutex::new(Vec::new()),
            queue_poll: Duration::from_millis(
                config.queue_poll_ms.unwrap_or(DEFAULT_QUEUE_POLL_MS).max(1),
            ),
            sweep_interval: Duration::from_millis(
                config.registry_sweep_ms.unwrap_or(DEFAULT_SWEEP_MS).max(1),
            ),
            over: AtomicBool::new(false),
            exit_started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            exit_done: OpFuture::new(),
            term_signal,
            log_guard: Mutex::new(log_guard),
            sweep_join: Mutex::new(None),
            interp_join: Mutex::new(None),
        });

        let sweeper = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("cyclert.{name}-sweep"))
                .spawn(move || registry_sweeper(inner, track_rx))?
        };
        *inner.sweep_join.lock() = Some(sweeper);

        let interp = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("cyclert.{name}-interp"))
                .spawn(move || interpreter(inner, cmd_rx))?
        };
        *inner.interp_join.lock() = Some(interp);

        tracing::info!("[Orchestrator] '{name}' started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    pub fn state(&self) -> ControlState {
        self.inner.core.state()
    }

    pub fn frequency(&self) -> u64 {
        self.inner.core.frequency()
    }

    /// Whether shutdown has fully completed.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn default_group(&self) -> Option<Arc<Group>> {
        self.inner.managed.find(DEFAULT_GROUP)
    }

    pub fn find_group(&self, name: &str) -> Option<Arc<Group>> {
        self.inner.managed.find(name)
    }

    /// Register `routine` into the `default` group (opcode 100).
    pub fn register_routine(&self, routine: Arc<Routine>) -> ControlResult<()> {
        ensure_unparented(routine.core())?;
        self.submit(Command::RegisterLeaf { leaf: routine })
    }

    /// Register an externally built group (opcode 101).
    pub fn register_group(&self, group: Arc<Group>) -> ControlResult<()> {
        ensure_unparented(group.core())?;
        self.submit(Command::RegisterGroup { group })
    }

    /// Create and register an empty group by name (opcode 102).
    pub fn register_group_by_name(&self, name: &str) -> ControlResult<()> {
        if name.is_empty() {
            return Err(ControlError::NullArgument("name"));
        }
        self.submit(Command::RegisterGroupByName { name: name.into() })
    }

    /// Register `routine` into `group`, registering the group first
    /// when it is not managed yet (opcode 103).
    pub fn register_routine_in_group(
        &self,
        routine: Arc<Routine>,
        group: Arc<Group>,
    ) -> ControlResult<()> {
        ensure_unparented(routine.core())?;
        self.submit(Command::RegisterLeafInGroup {
            leaf: routine,
            group,
        })
    }

    /// Like [`register_routine_in_group`](Self::register_routine_in_group)
    /// but resolving (or creating) the group by name (opcode 104).
    pub fn register_routine_in_named_group(
        &self,
        routine: Arc<Routine>,
        group: &str,
    ) -> ControlResult<()> {
        if group.is_empty() {
            return Err(ControlError::NullArgument("group"));
        }
        ensure_unparented(routine.core())?;
        self.submit(Command::RegisterLeafInNamedGroup {
            leaf: routine,
            group: group.into(),
        })
    }

    /// Detach `routine` from whichever managed group holds it, the
    /// `default` group checked first (opcode 200). The future resolves
    /// to the detached node, or `None` when nothing held it.
    pub fn remove_routine(&self, routine: Arc<Routine>) -> ControlResult<OpFuture<Arc<dyn Node>>> {
        let reply = OpFuture::new();
        self.submit(Command::RemoveLeaf {
            leaf: routine,
            reply: reply.clone(),
        })?;
        Ok(reply)
    }

    /// Unregister a managed group (opcode 201).
    pub fn remove_group(&self, group: Arc<Group>) -> ControlResult<OpFuture<Arc<dyn Node>>> {
        let reply = OpFuture::new();
        self.submit(Command::RemoveGroup {
            group,
            reply: reply.clone(),
        })?;
        Ok(reply)
    }

    /// Unregister a managed group by name (opcode 202).
    pub fn remove_group_by_name(&self, name: &str) -> ControlResult<OpFuture<Arc<dyn Node>>> {
        if name.is_empty() {
            return Err(ControlError::NullArgument("name"));
        }
        let reply = OpFuture::new();
        self.submit(Command::RemoveGroupByName {
            name: name.into(),
            reply: reply.clone(),
        })?;
        Ok(reply)
    }

    /// Detach `routine` from a specific managed group (opcode 203).
    pub fn remove_routine_from_group(
        &self,
        routine: Arc<Routine>,
        group: Arc<Group>,
    ) -> ControlResult<OpFuture<Arc<dyn Node>>> {
        let reply = OpFuture::new();
        self.submit(Command::RemoveLeafFromGroup {
            leaf: routine,
            group,
            reply: reply.clone(),
        })?;
        Ok(reply)
    }

    /// Detach `routine` from a managed group resolved by name
    /// (opcode 204).
    pub fn remove_routine_from_named_group(
        &self,
        routine: Arc<Routine>,
        group: &str,
    ) -> ControlResult<OpFuture<Arc<dyn Node>>> {
        if group.is_empty() {
            return Err(ControlError::NullArgument("group"));
        }
        let reply = OpFuture::new();
        self.submit(Command::RemoveLeafFromNamedGroup {
            leaf: routine,
            group: group.into(),
            reply: reply.clone(),
        })?;
        Ok(reply)
    }

    /// Change the orchestrator's own frequency (opcode 300). Managed
    /// groups and their inheriting children follow automatically.
    pub fn set_frequency(&self, frequency: u64) -> ControlResult<()> {
        self.submit(Command::SetFrequency {
            frequency: clamp_frequency(frequency),
        })
    }

    /// Ask every managed group whose name matches `pattern` (full
    /// match) for the given state (opcodes 400..=403). `New` can never
    /// be requested.
    pub fn request_trigger(&self, state: ControlState, pattern: &str) -> ControlResult<()> {
        if pattern.is_empty() {
            return Err(ControlError::NullArgument("pattern"));
        }
        let request = match state {
            ControlState::New => {
                return Err(ControlError::InvalidTransition {
                    node: pattern.to_string(),
                    state: ControlState::New.as_str(),
                })
            }
            ControlState::Executing => ControlRequest::Execute,
            ControlState::Paused => ControlRequest::Pause,
            ControlState::Stopped => ControlRequest::Stop,
            ControlState::Shutdown => ControlRequest::Shutdown,
        };
        let pattern = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|err| ControlError::Unknown(anyhow::anyhow!("bad pattern: {err}")))?;
        self.submit(Command::Trigger { request, pattern })
    }

    pub fn request_execute(&self) -> ControlResult<()> {
        self.request_trigger(ControlState::Executing, ".*")
    }

    pub fn request_pause(&self) -> ControlResult<()> {
        self.request_trigger(ControlState::Paused, ".*")
    }

    pub fn request_stop(&self) -> ControlResult<()> {
        self.request_trigger(ControlState::Stopped, ".*")
    }

    pub fn request_shutdown(&self) -> ControlResult<()> {
        self.request_trigger(ControlState::Shutdown, ".*")
    }

    /// Put an arbitrary node under the global registry so final
    /// shutdown reaches it.
    pub fn track(&self, node: Arc<dyn Node>) -> ControlResult<()> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(ControlError::Unavailable);
        }
        self.inner.track(node);
        Ok(())
    }

    /// Begin asynchronous teardown (opcode 302): stop both service
    /// threads, shut every tracked node down and join the awaited
    /// ones. Idempotent; every caller observes the same completion
    /// future, including for teardowns started by a termination
    /// signal. With `end_process` the process exits once teardown
    /// finished.
    pub fn exit(&self, end_process: bool) -> OpFuture<()> {
        if !self.inner.exit_started.load(Ordering::SeqCst) {
            let _ = self.inner.cmd_tx.send(Command::Exit { end_process });
        }
        self.inner.exit_done.clone()
    }

    /// One human-readable snapshot of the managed tree.
    pub fn status_report(&self) -> String {
        let inner = &self.inner;
        let groups = inner.managed.list();
        let tracked = inner.registry.lock().len();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "orchestrator '{}' [{}] {}hz, groups: {}, tracked: {}",
            inner.core.name(),
            inner.core.state(),
            inner.core.frequency(),
            groups.len(),
            tracked,
        );
        for group in groups {
            let children = group.children();
            let _ = writeln!(
                out,
                "  group '{}' [{}] {}hz, children: {}",
                group.name(),
                group.state(),
                group.frequency(),
                children.len(),
            );
            for child in children {
                let _ = writeln!(out, "    - '{}' [{}]", child.name(), child.state());
            }
        }
        out
    }

    fn submit(&self, cmd: Command) -> ControlResult<()> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(ControlError::Unavailable);
        }
        self.inner
            .cmd_tx
            .send(cmd)
            .map_err(|_| ControlError::Unavailable)
    }
}

fn ensure_unparented(core: &Arc<NodeCore>) -> ControlResult<()> {
    if let Some(parent) = core.parent_name() {
        return Err(ControlError::AlreadyOwned {
            node: core.name().to_string(),
            parent,
        });
    }
    Ok(())
}

/// Interpreter thread: creates the `default` group, then loops over
/// poll, managed sweep, drain until told to wind down.
fn interpreter(inner: Arc<ManagerInner>, cmd_rx: Receiver<Command>) {
    tracing::info!("[Orchestrator] '{}' interpreter started", inner.core.name());

    match Group::new(DEFAULT_GROUP) {
        Ok(group) => {
            group.set_await_on_shutdown(true);
            let node: Arc<dyn Node> = group.clone();
            match inner.managed.attach(group) {
                Ok(()) => inner.track(node),
                Err(err) => {
                    tracing::error!("[Orchestrator] default group registration failed: {err}")
                }
            }
        }
        Err(err) => tracing::error!("[Orchestrator] default group creation failed: {err}"),
    }

    while !inner.over.load(Ordering::Acquire) {
        if let Some(flag) = &inner.term_signal {
            if flag.swap(false, Ordering::SeqCst) {
                tracing::info!(
                    "[Orchestrator] '{}' caught termination signal",
                    inner.core.name()
                );
                begin_exit(&inner, true);
            }
        }

        let first = match cmd_rx.recv_timeout(inner.queue_poll) {
            Ok(cmd) => Some(cmd),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        inner.managed.sweep();

        if let Some(cmd) = first {
            process(&inner, cmd);
            while !inner.over.load(Ordering::Acquire) {
                match cmd_rx.try_recv() {
                    Ok(cmd) => process(&inner, cmd),
                    Err(_) => break,
                }
            }
        }
    }

    // Nothing will run these anymore; unblock any waiters.
    for cmd in cmd_rx.try_iter() {
        cmd.abandon();
    }
    tracing::info!("[Orchestrator] '{}' interpreter exited", inner.core.name());
}

fn process(inner: &Arc<ManagerInner>, cmd: Command) {
    let opcode = cmd.opcode();
    let label = format!("{cmd:?}");
    match execute(inner, cmd) {
        Ok(()) => tracing::debug!("[Orchestrator] {label} done"),
        Err(err) => tracing::warn!("[Orchestrator] {label} (opcode {opcode}) failed: {err}"),
    }
}

fn execute(inner: &Arc<ManagerInner>, cmd: Command) -> ControlResult<()> {
    match cmd {
        Command::RegisterLeaf { leaf } => {
            let group = inner
                .managed
                .find(DEFAULT_GROUP)
                .ok_or_else(|| ControlError::NotFound(DEFAULT_GROUP.into()))?;
            add_to_group(inner, &group, leaf)
        }
        Command::RegisterGroup { group } => register_group(inner, group),
        Command::RegisterGroupByName { name } => {
            if inner.managed.name_taken(&name) {
                return Err(ControlError::NameTaken(name));
            }
            register_group(inner, Group::new(&name)?)
        }
        Command::RegisterLeafInGroup { leaf, group } => {
            if !inner.managed.contains(&group) {
                register_group(inner, group.clone())?;
            }
            add_to_group(inner, &group, leaf)
        }
        Command::RegisterLeafInNamedGroup { leaf, group } => {
            let group = match inner.managed.find(&group) {
                Some(found) => found,
                None => {
                    let created = Group::new(&group)?;
                    register_group(inner, created.clone())?;
                    created
                }
            };
            add_to_group(inner, &group, leaf)
        }
        Command::RemoveLeaf { leaf, reply } => finish(reply, remove_leaf(inner, &leaf)),
        Command::RemoveGroup { group, reply } => {
            finish(reply, remove_group(inner, group.core().clone()))
        }
        Command::RemoveGroupByName { name, reply } => {
            let found = inner
                .managed
                .find(&name)
                .ok_or(ControlError::NotFound(name));
            finish(
                reply,
                found.and_then(|g| remove_group(inner, g.core().clone())),
            )
        }
        Command::RemoveLeafFromGroup { leaf, group, reply } => {
            finish(reply, remove_leaf_from(inner, &leaf, &group))
        }
        Command::RemoveLeafFromNamedGroup { leaf, group, reply } => {
            let found = inner
                .managed
                .find(&group)
                .ok_or(ControlError::NotFound(group));
            finish(reply, found.and_then(|g| remove_leaf_from(inner, &leaf, &g)))
        }
        Command::SetFrequency { frequency } => {
            inner.core.set_frequency(frequency);
            for group in inner.managed.list() {
                group.core().resync_inherited_rate();
            }
            Ok(())
        }
        Command::Exit { end_process } => {
            begin_exit(inner, end_process);
            Ok(())
        }
        Command::Trigger { request, pattern } => {
            for group in inner.managed.list() {
                if !pattern.is_match(group.name()) || group.state() == ControlState::Shutdown {
                    continue;
                }
                match group.request(request) {
                    Ok(()) => {
                        tracing::debug!("[Orchestrator] '{}' {request:?} ok", group.path())
                    }
                    Err(err) => {
                        tracing::debug!(
                            "[Orchestrator] '{}' {request:?} skipped: {err}",
                            group.path()
                        )
                    }
                }
            }
            Ok(())
        }
    }
}

fn finish<T>(reply: OpFuture<T>, result: ControlResult<T>) -> ControlResult<()> {
    match result {
        Ok(value) => {
            reply.complete(Some(value));
            Ok(())
        }
        Err(err) => {
            reply.complete(None);
            Err(err)
        }
    }
}

fn register_group(inner: &Arc<ManagerInner>, group: Arc<Group>) -> ControlResult<()> {
    ensure_unparented(group.core())?;
    if inner.managed.name_taken(group.name()) {
        return Err(ControlError::NameTaken(group.name().to_string()));
    }
    group.set_await_on_shutdown(true);
    let node: Arc<dyn Node> = group.clone();
    inner.managed.attach(group)?;
    inner.track(node);
    Ok(())
}

fn add_to_group(
    inner: &Arc<ManagerInner>,
    group: &Arc<Group>,
    leaf: Arc<Routine>,
) -> ControlResult<()> {
    ensure_unparented(leaf.core())?;
    let node: Arc<dyn Node> = leaf;
    if group.add(node.clone())? {
        node.set_await_on_shutdown(true);
        inner.track(node);
        Ok(())
    } else {
        Err(ControlError::Unknown(anyhow::anyhow!(
            "'{}' was not added to '{}'",
            node.name(),
            group.name()
        )))
    }
}

fn remove_leaf(inner: &Arc<ManagerInner>, leaf: &Arc<Routine>) -> ControlResult<Arc<dyn Node>> {
    let mut groups = inner.managed.list();
    groups.sort_by_key(|g| g.name() != DEFAULT_GROUP);
    for group in groups {
        if let Some(node) = group.remove(leaf.as_ref()) {
            node.set_await_on_shutdown(false);
            return Ok(node);
        }
    }
    Err(ControlError::NotFound(leaf.name().to_string()))
}

fn remove_group(inner: &Arc<ManagerInner>, core: Arc<NodeCore>) -> ControlResult<Arc<dyn Node>> {
    match inner.managed.remove(&core) {
        Some(group) => {
            group.set_await_on_shutdown(false);
            Ok(group)
        }
        None => Err(ControlError::NotFound(core.name().to_string())),
    }
}

fn remove_leaf_from(
    inner: &Arc<ManagerInner>,
    leaf: &Arc<Routine>,
    group: &Arc<Group>,
) -> ControlResult<Arc<dyn Node>> {
    if !inner.managed.contains(group) {
        return Err(ControlError::NotFound(group.name().to_string()));
    }
    match group.remove(leaf.as_ref()) {
        Some(node) => {
            node.set_await_on_shutdown(false);
            Ok(node)
        }
        None => Err(ControlError::NotFound(leaf.name().to_string())),
    }
}

/// Launch the shutdown coordinator exactly once. Later calls are
/// no-ops; every waiter observes `exit_done`.
fn begin_exit(inner: &Arc<ManagerInner>, end_process: bool) {
    if inner.exit_started.swap(true, Ordering::SeqCst) {
        return;
    }
    let coordinator = {
        let inner = inner.clone();
        std::thread::Builder::new()
            .name(format!("cyclert.{}-exit", inner.core.name()))
            .spawn(move || shutdown_coordinator(inner, end_process))
    };
    if let Err(err) = coordinator {
        tracing::error!("[Orchestrator] failed to spawn shutdown coordinator: {err}");
    }
}

/// Teardown: stop both service threads, then shut down and join
/// tracked nodes in two passes.
fn shutdown_coordinator(inner: Arc<ManagerInner>, end_process: bool) {
    let name = inner.core.name().to_string();
    tracing::info!("[Orchestrator] '{name}' shutting down");

    inner.over.store(true, Ordering::Release);
    if let Some(handle) = inner.sweep_join.lock().take() {
        let _ = handle.join();
    }
    if let Some(handle) = inner.interp_join.lock().take() {
        let _ = handle.join();
    }
    let _ = inner.core.apply(ControlRequest::Shutdown);

    let nodes: Vec<Arc<dyn Node>> = inner.registry.lock().clone();
    for node in &nodes {
        if node.state() == ControlState::Shutdown {
            tracing::info!("[Orchestrator] '{}' shutdown ok (already)", node.path());
            continue;
        }
        match node.request_shutdown() {
            Ok(()) => tracing::info!("[Orchestrator] '{}' shutdown ok", node.path()),
            Err(err) => {
                tracing::warn!("[Orchestrator] '{}' shutdown failed: {err}", node.path())
            }
        }
    }
    for node in &nodes {
        if node.await_on_shutdown() {
            node.join();
            tracing::info!("[Orchestrator] '{}' joined", node.path());
        }
    }

    inner.terminated.store(true, Ordering::Release);
    inner.exit_done.complete(Some(()));
    tracing::info!("[Orchestrator] '{name}' terminated");
    // Dropping the guard flushes any file appender.
    inner.log_guard.lock().take();

    if end_process {
        std::process::exit(0);
    }
}

/// Sweeper thread: folds tracked nodes into the global registry and
/// forgets the ones that reached `Shutdown`.
fn registry_sweeper(inner: Arc<ManagerInner>, track_rx: Receiver<Arc<dyn Node>>) {
    tracing::debug!("[Orchestrator] '{}' sweeper started", inner.core.name());
    while !inner.over.load(Ordering::Acquire) {
        for node in track_rx.try_iter() {
            inner.absorb(node);
        }
        {
            let mut registry = inner.registry.lock();
            let before = registry.len();
            registry.retain(|n| n.state() != ControlState::Shutdown);
            let dropped = before - registry.len();
            if dropped > 0 {
                tracing::debug!(
                    "[Orchestrator] '{}' forgot {dropped} finished node(s)",
                    inner.core.name()
                );
            }
        }
        nap(&inner, inner.sweep_interval);
    }
    // Final fold so the shutdown passes see late registrations.
    for node in track_rx.try_iter() {
        inner.absorb(node);
    }
    tracing::debug!("[Orchestrator] '{}' sweeper exited", inner.core.name());
}

/// Sleep up to `total`, waking early when teardown starts.
fn nap(inner: &ManagerInner, total: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while !inner.over.load(Ordering::Acquire) && remaining > Duration::ZERO {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{RoutineCtl, RoutineModel};
    use std::time::Instant;

    struct Idle;
    impl RoutineModel for Idle {
        fn execute(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_config(name: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            name: Some(name.to_string()),
            registry_sweep_ms: Some(20),
            queue_poll_ms: Some(5),
            handle_term_signals: false,
            frequency: Some(200),
            logger: None,
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

    #[test]
    fn spawn_creates_the_default_group() {
        let orch = Orchestrator::spawn(fast_config("m1")).unwrap();
        assert!(wait_until(
            || orch.default_group().is_some(),
            Duration::from_secs(2)
        ));
        let default = orch.default_group().unwrap();
        assert!(default.await_on_shutdown());
        assert_eq!(default.path(), "m1.default");
        assert!(orch.status_report().contains("group 'default'"));
        orch.exit(false).get();
    }

    #[test]
    fn registered_routine_lands_in_default_and_runs_by_pattern() {
        let orch = Orchestrator::spawn(fast_config("m2")).unwrap();
        let leaf = Routine::new("pump", Idle).unwrap();
        orch.register_routine(leaf.clone()).unwrap();

        assert!(wait_until(
            || leaf.core().parent_name().as_deref() == Some("default"),
            Duration::from_secs(2)
        ));
        assert!(leaf.await_on_shutdown());
        assert_eq!(leaf.path(), "m2.default.pump");

        orch.request_trigger(ControlState::Executing, "def.*").unwrap();
        assert!(wait_until(
            || leaf.state() == ControlState::Executing,
            Duration::from_secs(3)
        ));

        // A non-matching pattern touches nothing.
        orch.request_trigger(ControlState::Paused, "nosuch.*").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(leaf.state(), ControlState::Executing);

        assert_eq!(orch.exit(false).get(), Some(()));
        assert_eq!(leaf.state(), ControlState::Shutdown);
    }

    #[test]
    fn named_group_registration_and_removal_round_trip() {
        let orch = Orchestrator::spawn(fast_config("m3")).unwrap();
        let leaf = Routine::new("worker", Idle).unwrap();
        orch.register_routine_in_named_group(leaf.clone(), "pool")
            .unwrap();

        assert!(wait_until(
            || orch.find_group("pool").is_some() && leaf.core().has_parent(),
            Duration::from_secs(2)
        ));
        assert_eq!(leaf.path(), "m3.pool.worker");

        let removed = orch.remove_routine(leaf.clone()).unwrap().get();
        let removed = removed.expect("leaf should have been held by a managed group");
        assert!(crate::node::same_node(removed.as_ref(), leaf.as_ref()));
        assert!(!leaf.core().has_parent());
        assert!(!leaf.await_on_shutdown());

        let gone = orch.remove_routine(leaf.clone()).unwrap().get();
        assert!(gone.is_none());

        orch.exit(false).get();
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let orch = Orchestrator::spawn(fast_config("m4")).unwrap();
        orch.register_group_by_name("pool").unwrap();
        assert!(wait_until(
            || orch.find_group("pool").is_some(),
            Duration::from_secs(2)
        ));

        // Second registration fails inside the interpreter; the name
        // still resolves to the original group.
        let original = orch.find_group("pool").unwrap();
        orch.register_group_by_name("pool").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let resolved = orch.find_group("pool").unwrap();
        assert!(Arc::ptr_eq(original.core(), resolved.core()));

        orch.exit(false).get();
    }

    #[test]
    fn frequency_cascades_through_managed_groups() {
        let orch = Orchestrator::spawn(fast_config("m5")).unwrap();
        let leaf = Routine::new("f", Idle).unwrap();
        orch.register_routine(leaf.clone()).unwrap();
        assert!(wait_until(|| leaf.core().has_parent(), Duration::from_secs(2)));

        orch.set_frequency(77).unwrap();
        assert!(wait_until(|| leaf.frequency() == 77, Duration::from_secs(2)));

        orch.exit(false).get();
    }

    #[test]
    fn trigger_validation_happens_synchronously() {
        let orch = Orchestrator::spawn(fast_config("m6")).unwrap();
        assert!(matches!(
            orch.request_trigger(ControlState::New, ".*"),
            Err(ControlError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.request_trigger(ControlState::Executing, ""),
            Err(ControlError::NullArgument("pattern"))
        ));
        assert!(matches!(
            orch.request_trigger(ControlState::Executing, "("),
            Err(ControlError::Unknown(_))
        ));
        orch.exit(false).get();
    }

    #[test]
    fn exit_is_idempotent_and_finalizes_the_handle() {
        let orch = Orchestrator::spawn(fast_config("m7")).unwrap();
        let leaf = Routine::new("last", Idle).unwrap();
        orch.register_routine(leaf.clone()).unwrap();
        assert!(wait_until(|| leaf.core().has_parent(), Duration::from_secs(2)));
        orch.request_execute().unwrap();
        assert!(wait_until(
            || leaf.state() == ControlState::Executing,
            Duration::from_secs(3)
        ));

        let first = orch.exit(false);
        let second = orch.exit(false);
        assert_eq!(first.get(), Some(()));
        assert_eq!(second.get(), Some(()));

        assert!(orch.is_terminated());
        assert_eq!(orch.state(), ControlState::Shutdown);
        assert_eq!(leaf.state(), ControlState::Shutdown);
        leaf.join();

        let another = Routine::new("late", Idle).unwrap();
        assert!(matches!(
            orch.register_routine(another),
            Err(ControlError::Unavailable)
        ));
        assert!(matches!(
            orch.set_frequency(10),
            Err(ControlError::Unavailable)
        ));
    }

    #[test]
    fn internally_started_teardown_resolves_later_exit_calls() {
        let orch = Orchestrator::spawn(fast_config("m8")).unwrap();
        assert!(wait_until(
            || orch.default_group().is_some(),
            Duration::from_secs(2)
        ));

        // Teardown entered without a user-held future, the way the
        // termination-signal path enters it.
        begin_exit(&orch.inner, false);
        assert_eq!(orch.exit(false).get(), Some(()));
        assert!(orch.is_terminated());
    }

    #[test]
    fn two_orchestrators_coexist() {
        let left = Orchestrator::spawn(fast_config("left")).unwrap();
        let right = Orchestrator::spawn(fast_config("right")).unwrap();
        let a = Routine::new("a", Idle).unwrap();
        let b = Routine::new("b", Idle).unwrap();
        left.register_routine(a.clone()).unwrap();
        right.register_routine(b.clone()).unwrap();

        assert!(wait_until(
            || a.core().has_parent() && b.core().has_parent(),
            Duration::from_secs(2)
        ));
        assert_eq!(a.path(), "left.default.a");
        assert_eq!(b.path(), "right.default.b");

        left.exit(false).get();
        assert!(!right.is_terminated());
        right.exit(false).get();
    }
}
