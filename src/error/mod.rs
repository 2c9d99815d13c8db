use std::error::Error;
use std::fmt;

pub type ControlResult<T> = Result<T, ControlError>;

/// Failures surfaced by control requests, ownership changes and
/// orchestrator lookups.
#[derive(Debug)]
pub enum ControlError {
    /// The requested control transition is not legal from the node's
    /// current state (includes re-requesting the current state).
    InvalidTransition { node: String, state: &'static str },
    /// The node already has a parent and cannot be adopted again.
    AlreadyOwned { node: String, parent: String },
    /// A required argument was empty or missing.
    NullArgument(&'static str),
    /// A lookup by name or instance found nothing.
    NotFound(String),
    /// A group with this name is already registered.
    NameTaken(String),
    /// A future was polled before its result was set.
    NotReady,
    /// The orchestrator has already been terminated.
    Unavailable,
    Unknown(anyhow::Error),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { node, state } => {
                write!(f, "invalid transition for '{node}': already {state}")
            }
            Self::AlreadyOwned { node, parent } => {
                write!(f, "'{node}' already has '{parent}' as a parent")
            }
            Self::NullArgument(what) => write!(f, "argument '{what}' is empty"),
            Self::NotFound(what) => write!(f, "'{what}' was not found"),
            Self::NameTaken(name) => write!(f, "name '{name}' is already used"),
            Self::NotReady => write!(f, "no result has been set yet"),
            Self::Unavailable => write!(f, "orchestrator is terminated"),
            Self::Unknown(err) => write!(f, "unknown error: {err}"),
        }
    }
}

impl Error for ControlError {}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Unknown(err)
    }
}
