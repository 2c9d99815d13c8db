use super::RoutineCtl;

/// Routine phase currently (or last) run by a worker. Distinct from
/// the control state: the control state is what was requested, the
/// phase is what the worker actually got around to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Phase {
    New = 0,
    Init = 1,
    Ready = 2,
    Execute = 3,
    Pause = 4,
    Stop = 5,
    Destroy = 6,
}

impl Phase {
    pub(crate) const COUNT: usize = 7;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Init => "Init",
            Self::Ready => "Ready",
            Self::Execute => "Execute",
            Self::Pause => "Pause",
            Self::Stop => "Stop",
            Self::Destroy => "Destroy",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Init,
            2 => Self::Ready,
            3 => Self::Execute,
            4 => Self::Pause,
            5 => Self::Stop,
            6 => Self::Destroy,
            _ => Self::New,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the worker should do after [`RoutineModel::on_fault`] ran.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The fault was absorbed; keep cycling.
    Resume,
    /// The fault was handled but the routine should wind down.
    Handled,
    /// No handling was possible; the routine shuts down.
    Unhandled,
}

/// User logic driven by a routine worker. Every phase callback runs on
/// the worker thread with the node lock released, so calling back into
/// `ctl` is always safe.
///
/// Phase order per lifecycle: `init` once, `ready` on every entry from
/// `New` or `Stopped`, then `execute` repeatedly while the node is
/// `Executing`, `pause` once on leaving it, `stop` on the way down and
/// `destroy` exactly once at shutdown.
pub trait RoutineModel: Send + 'static {
    fn init(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
        Ok(())
    }

    fn ready(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
        Ok(())
    }

    /// The frame body. Called once per paced cycle.
    fn execute(&mut self, ctl: &RoutineCtl) -> anyhow::Result<()>;

    fn pause(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when a phase callback returned an error or panicked.
    /// Anything but [`FaultOutcome::Resume`] forces the routine into
    /// `Shutdown`.
    fn on_fault(&mut self, _phase: Phase, _error: anyhow::Error) -> FaultOutcome {
        FaultOutcome::Unhandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_u8() {
        for p in [
            Phase::New,
            Phase::Init,
            Phase::Ready,
            Phase::Execute,
            Phase::Pause,
            Phase::Stop,
            Phase::Destroy,
        ] {
            assert_eq!(Phase::from_u8(p as u8), p);
        }
    }
}
