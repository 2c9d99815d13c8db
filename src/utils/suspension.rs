use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where a worker thread is currently suspended, if anywhere.
///
/// Published by the worker itself so tests and monitors can observe the
/// exact blocking site instead of guessing from wall-clock timing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SuspensionPoint {
    /// Worker thread not spawned yet.
    NotStarted = 0,
    /// Actively running user code or bookkeeping.
    Running = 1,
    /// Waiting for the control state to leave `New`.
    BlockedOnNew = 2,
    /// Paused and waiting for the next control signal.
    BlockedOnPause = 3,
    /// Stopped and waiting for the next control signal.
    BlockedOnStop = 4,
    /// Sleeping off the remainder of a frame, lock released.
    PacingSleep = 5,
    /// Supervisor waiting out its bounded sweep interval.
    SweepWait = 6,
    /// Worker thread has exited permanently.
    Exited = 7,
}

impl SuspensionPoint {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::BlockedOnNew,
            3 => Self::BlockedOnPause,
            4 => Self::BlockedOnStop,
            5 => Self::PacingSleep,
            6 => Self::SweepWait,
            7 => Self::Exited,
            _ => Self::NotStarted,
        }
    }
}

/// Lock-free cell holding a worker's current [`SuspensionPoint`].
#[derive(Clone, Default, Debug)]
pub struct SuspensionCell(Arc<CachePadded<AtomicU8>>);

impl SuspensionCell {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn set(&self, point: SuspensionPoint) {
        self.0.store(point as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn get(&self) -> SuspensionPoint {
        SuspensionPoint::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_point() {
        let cell = SuspensionCell::new();
        assert_eq!(cell.get(), SuspensionPoint::NotStarted);
        for p in [
            SuspensionPoint::Running,
            SuspensionPoint::BlockedOnNew,
            SuspensionPoint::BlockedOnPause,
            SuspensionPoint::BlockedOnStop,
            SuspensionPoint::PacingSleep,
            SuspensionPoint::SweepWait,
            SuspensionPoint::Exited,
        ] {
            cell.set(p);
            assert_eq!(cell.get(), p);
        }
    }
}
