use crate::utils::logger::LoggerConfig;
use serde::{Deserialize, Serialize};

/// Lowest accepted execution frequency (cycles per second).
pub const MIN_FREQUENCY: u64 = 1;
/// Highest accepted execution frequency (cycles per second).
pub const MAX_FREQUENCY: u64 = 1_000_000_000;
/// Frequency assigned to a node that never had one set.
pub const DEFAULT_FREQUENCY: u64 = 60;

pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Clamp a requested frequency into `[MIN_FREQUENCY, MAX_FREQUENCY]`.
#[inline]
pub fn clamp_frequency(frequency: u64) -> u64 {
    frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}

/// Orchestrator tuning knobs. `None` fields fall back to the defaults
/// noted per field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Name of the orchestrator node. Default: "orchestrator".
    pub name: Option<String>,
    /// Interval between global-registry sweeps, ms. Default: 500.
    pub registry_sweep_ms: Option<u64>,
    /// Interpreter poll interval while the command queue is empty, ms.
    /// Default: 100.
    pub queue_poll_ms: Option<u64>,
    /// Install a handler that converts SIGTERM/SIGINT into `exit(true)`.
    #[serde(default)]
    pub handle_term_signals: bool,
    /// Frequency of the orchestrator node itself. Default: 60.
    pub frequency: Option<u64>,
    /// Logging bootstrap applied once at spawn. `None` leaves the
    /// global subscriber untouched.
    pub logger: Option<LoggerConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: None,
            registry_sweep_ms: None,
            queue_poll_ms: None,
            handle_term_signals: false,
            frequency: None,
            logger: None,
        }
    }
}

/// Construction options for a [`Routine`](crate::routine::Routine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineOptions {
    /// Explicit frequency; `None` keeps the default of 60.
    pub frequency: Option<u64>,
    /// Mirror the parent's frequency while a parent exists.
    pub inherit_rate: bool,
    /// Pin the worker thread to a specific CPU core.
    pub core_id: Option<usize>,
    /// Block orchestrator shutdown until this routine's worker exits.
    #[serde(default)]
    pub await_on_shutdown: bool,
}

impl Default for RoutineOptions {
    fn default() -> Self {
        Self {
            frequency: None,
            inherit_rate: true,
            core_id: None,
            await_on_shutdown: false,
        }
    }
}
