pub use crate::config::{
    clamp_frequency, OrchestratorConfig, RoutineOptions, DEFAULT_FREQUENCY, MAX_FREQUENCY,
    MIN_FREQUENCY,
};
pub use crate::error::{ControlError, ControlResult};
pub use crate::future::OpFuture;
pub use crate::group::Group;
pub use crate::manager::{Orchestrator, DEFAULT_GROUP};
pub use crate::node::{same_node, ControlRequest, ControlState, Node, NodeCore};
pub use crate::routine::{FaultOutcome, Phase, Routine, RoutineCtl, RoutineModel};
pub use crate::utils::SuspensionPoint;
