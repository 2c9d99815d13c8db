/// Lifecycle state of a control node.
///
/// `New` is the only state a node is born into and the only one that can
/// never be requested again once left. `Shutdown` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ControlState {
    New = 0,
    Executing = 1,
    Paused = 2,
    Stopped = 3,
    Shutdown = 4,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Executing => "Executing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Shutdown => "Shutdown",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Executing,
            2 => Self::Paused,
            3 => Self::Stopped,
            4 => Self::Shutdown,
            _ => Self::New,
        }
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control transition that can be asked of a node.
///
/// `New` is deliberately absent: nothing can be moved back to `New`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ControlRequest {
    Execute,
    Pause,
    Stop,
    Shutdown,
}

impl ControlRequest {
    /// State the node ends up in when the request is accepted.
    #[inline]
    pub fn target(&self) -> ControlState {
        match self {
            Self::Execute => ControlState::Executing,
            Self::Pause => ControlState::Paused,
            Self::Stop => ControlState::Stopped,
            Self::Shutdown => ControlState::Shutdown,
        }
    }

    /// Whether the transition is legal from `from`. Re-requesting the
    /// current state is never legal.
    pub fn allowed_from(&self, from: ControlState) -> bool {
        use ControlState::*;
        match self {
            Self::Execute => matches!(from, New | Paused | Stopped),
            Self::Pause => matches!(from, New | Executing),
            Self::Stop => matches!(from, New | Executing | Paused),
            Self::Shutdown => from != Shutdown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.target().as_str()
    }
}
