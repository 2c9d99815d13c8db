pub use model::{FaultOutcome, Phase, RoutineModel};

mod model;
mod pacing;

use crate::config::{RoutineOptions, DEFAULT_FREQUENCY};
use crate::error::ControlResult;
use crate::node::{ControlRequest, ControlState, Node, NodeCore, NodeInner};
use crate::routine::pacing::{sleep_in_slices, Pacer, SLEEP_SLICES};
use crate::utils::{try_pin_core, SuspensionPoint};
use parking_lot::{Mutex, MutexGuard};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame-paced leaf node. Owns one worker thread that drives a
/// [`RoutineModel`] through its phases at the node's frequency.
///
/// The worker is started lazily by the first successful control
/// request and exits for good once the node reaches `Shutdown`.
pub struct Routine {
    core: Arc<NodeCore>,
    stats: Arc<RoutineStats>,
    model: Mutex<Option<Box<dyn RoutineModel>>>,
    core_id: Option<usize>,
}

impl Routine {
    pub fn new(name: &str, model: impl RoutineModel) -> ControlResult<Arc<Self>> {
        Self::with_options(name, Box::new(model), RoutineOptions::default())
    }

    pub fn with_options(
        name: &str,
        model: Box<dyn RoutineModel>,
        options: RoutineOptions,
    ) -> ControlResult<Arc<Self>> {
        let core = NodeCore::new(
            name,
            options.frequency.unwrap_or(DEFAULT_FREQUENCY),
            options.inherit_rate,
        )?;
        core.set_await_on_shutdown(options.await_on_shutdown);
        Ok(Arc::new(Self {
            core,
            stats: Arc::new(RoutineStats::new()),
            model: Mutex::new(Some(model)),
            core_id: options.core_id,
        }))
    }

    /// Control handle usable from inside the model's own callbacks.
    pub fn ctl(&self) -> RoutineCtl {
        RoutineCtl {
            core: self.core.clone(),
        }
    }

    /// Phase the worker ran last (or is running).
    pub fn phase(&self) -> Phase {
        self.stats.phase()
    }

    /// Wall time of the most recent run of `phase`, if it ever ran.
    pub fn phase_duration(&self, phase: Phase) -> Option<Duration> {
        self.stats.duration(phase)
    }

    /// Correction multiplier applied to pacing sleeps.
    pub fn inner_adjust(&self) -> f64 {
        self.stats.inner_adjust()
    }

    /// Achieved-versus-target rate of the last full cycle.
    pub fn outer_adjust(&self) -> f64 {
        self.stats.outer_adjust()
    }

    /// Frequency actually being achieved, estimated from the last
    /// cycle.
    pub fn effective_frequency(&self) -> f64 {
        self.core.frequency() as f64 * self.stats.outer_adjust()
    }

    fn ensure_started(&self) {
        let Some(model) = self.model.lock().take() else {
            return;
        };
        let core = self.core.clone();
        let stats = self.stats.clone();
        let core_id = self.core_id;
        let thread_name = format!("cyclert.{}", self.core.name());
        self.core
            .spawn_worker(thread_name, move || routine_worker(core, stats, model, core_id));
    }
}

impl Node for Routine {
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
}

/// Cheap clonable handle handed to [`RoutineModel`] callbacks so user
/// logic can steer its own node. Callbacks run with the node lock
/// released, so these calls never self-deadlock.
#[derive(Clone)]
pub struct RoutineCtl {
    core: Arc<NodeCore>,
}

impl RoutineCtl {
    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn path(&self) -> String {
        self.core.path()
    }

    pub fn state(&self) -> ControlState {
        self.core.state()
    }

    pub fn frequency(&self) -> u64 {
        self.core.frequency()
    }

    pub fn set_frequency(&self, frequency: u64) {
        self.core.set_frequency(frequency);
    }

    pub fn request_execute(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Execute)
    }

    pub fn request_pause(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Pause)
    }

    pub fn request_stop(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Stop)
    }

    pub fn request_shutdown(&self) -> ControlResult<()> {
        self.core.apply(ControlRequest::Shutdown)
    }
}

/// Lock-free mirror of the worker's phase bookkeeping, readable from
/// any thread.
struct RoutineStats {
    phase: AtomicU8,
    durations: [AtomicI64; Phase::COUNT],
    inner_bits: AtomicU64,
    outer_bits: AtomicU64,
}

impl RoutineStats {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::New as u8),
            durations: std::array::from_fn(|_| AtomicI64::new(-1)),
            inner_bits: AtomicU64::new(1.0_f64.to_bits()),
            outer_bits: AtomicU64::new(1.0_f64.to_bits()),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn record(&self, phase: Phase, nanos: u64) {
        self.durations[phase as usize].store(nanos as i64, Ordering::Relaxed);
    }

    fn duration(&self, phase: Phase) -> Option<Duration> {
        let nanos = self.durations[phase as usize].load(Ordering::Relaxed);
        (nanos >= 0).then(|| Duration::from_nanos(nanos as u64))
    }

    fn publish_adjust(&self, inner: f64, outer: f64) {
        self.inner_bits.store(inner.to_bits(), Ordering::Relaxed);
        self.outer_bits.store(outer.to_bits(), Ordering::Relaxed);
    }

    fn inner_adjust(&self) -> f64 {
        f64::from_bits(self.inner_bits.load(Ordering::Relaxed))
    }

    fn outer_adjust(&self) -> f64 {
        f64::from_bits(self.outer_bits.load(Ordering::Relaxed))
    }
}

/// Runs one phase callback under pacing: measure the callback, sleep
/// off the remainder of the frame in slices with the lock released,
/// then recalibrate both multipliers.
struct PhaseRunner {
    core: Arc<NodeCore>,
    stats: Arc<RoutineStats>,
    ctl: RoutineCtl,
    model: Box<dyn RoutineModel>,
    pacer: Pacer,
}

impl PhaseRunner {
    fn run(&mut self, guard: &mut MutexGuard<'_, NodeInner>, phase: Phase) {
        let cycle_start = Instant::now();
        let target_ns = self.pacer.target_ns(self.core.frequency());

        self.stats.set_phase(phase);
        let phase_start = Instant::now();
        let fault = {
            let model = &mut self.model;
            let ctl = &self.ctl;
            let suspension = self.core.suspension_cell().clone();
            let path = self.core.path();
            MutexGuard::unlocked(guard, move || {
                suspension.set(SuspensionPoint::Running);
                let caught = std::panic::catch_unwind(AssertUnwindSafe(|| match phase {
                    Phase::Init => model.init(ctl),
                    Phase::Ready => model.ready(ctl),
                    Phase::Execute => model.execute(ctl),
                    Phase::Pause => model.pause(ctl),
                    Phase::Stop => model.stop(ctl),
                    Phase::Destroy => model.destroy(ctl),
                    Phase::New => Ok(()),
                }));
                let error = match caught {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(panic) => Some(anyhow::anyhow!(
                        "{phase} panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                };
                error.map(|err| {
                    tracing::warn!("[Routine] '{path}' fault in {phase}: {err}");
                    model.on_fault(phase, err)
                })
            })
        };
        let elapsed_ns = phase_start.elapsed().as_nanos() as u64;
        self.stats.record(phase, elapsed_ns);

        match fault {
            Some(FaultOutcome::Resume) => {
                tracing::debug!("[Routine] '{}' resumed after fault in {phase}", self.core.path());
            }
            Some(outcome) => {
                tracing::warn!(
                    "[Routine] '{}' shutting down after {outcome:?} fault in {phase}",
                    self.core.path()
                );
                if guard.state != ControlState::Shutdown {
                    self.core.store_state(&mut *guard, ControlState::Shutdown);
                }
            }
            None => {}
        }

        let remaining = self.pacer.remaining_ns(target_ns, elapsed_ns);
        let slice = remaining / SLEEP_SLICES;
        if slice > 0 {
            let deadline = Instant::now() + Duration::from_nanos(remaining as u64);
            let interrupt = self.core.interrupt().clone();
            let suspension = self.core.suspension_cell().clone();
            let actual = MutexGuard::unlocked(guard, move || {
                suspension.set(SuspensionPoint::PacingSleep);
                let slept = sleep_in_slices(slice, deadline, &interrupt);
                suspension.set(SuspensionPoint::Running);
                slept
            });
            self.pacer.recalibrate_inner(slice * SLEEP_SLICES, actual);
        }
        self.pacer
            .finish_cycle(target_ns, cycle_start.elapsed().as_nanos() as u64);
        self.stats
            .publish_adjust(self.pacer.inner_adjust(), self.pacer.outer_adjust());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

fn routine_worker(
    core: Arc<NodeCore>,
    stats: Arc<RoutineStats>,
    model: Box<dyn RoutineModel>,
    core_id: Option<usize>,
) {
    if let Some(id) = core_id {
        match try_pin_core(id) {
            Ok(id) => tracing::debug!("[Routine] '{}' pinned to core {id}", core.path()),
            Err(err) => tracing::warn!("[Routine] '{}' core pinning failed: {err}", core.path()),
        }
    }

    let ctl = RoutineCtl { core: core.clone() };
    let mut runner = PhaseRunner {
        core: core.clone(),
        stats: stats.clone(),
        ctl,
        model,
        pacer: Pacer::new(),
    };
    let cond = core.condition(0);
    let suspension = core.suspension_cell().clone();

    let mut guard = core.lock();
    while guard.state == ControlState::New {
        suspension.set(SuspensionPoint::BlockedOnNew);
        cond.wait(&mut guard);
    }
    suspension.set(SuspensionPoint::Running);

    let mut initialized = false;
    while guard.state != ControlState::Shutdown {
        if !initialized {
            runner.run(&mut guard, Phase::Init);
            initialized = true;
        }
        if stats.phase() != Phase::Ready {
            runner.run(&mut guard, Phase::Ready);
        }
        while matches!(guard.state, ControlState::Executing | ControlState::Paused) {
            while guard.state == ControlState::Executing {
                runner.run(&mut guard, Phase::Execute);
            }
            // Leaving Executing always lands in pause, even on the way
            // down to Stopped or Shutdown.
            if stats.phase() != Phase::Pause {
                runner.run(&mut guard, Phase::Pause);
            }
            if guard.state == ControlState::Paused {
                suspension.set(SuspensionPoint::BlockedOnPause);
                cond.wait(&mut guard);
                suspension.set(SuspensionPoint::Running);
            }
        }
        if stats.phase() != Phase::Stop {
            runner.run(&mut guard, Phase::Stop);
        }
        if guard.state == ControlState::Stopped {
            suspension.set(SuspensionPoint::BlockedOnStop);
            cond.wait(&mut guard);
            suspension.set(SuspensionPoint::Running);
        }
    }
    runner.run(&mut guard, Phase::Destroy);
    drop(guard);
    suspension.set(SuspensionPoint::Exited);
    tracing::debug!("[Routine] '{}' worker exited", core.path());
}
