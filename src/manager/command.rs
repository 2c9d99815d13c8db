use crate::future::OpFuture;
use crate::group::Group;
use crate::node::{ControlRequest, Node};
use crate::routine::Routine;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Work item for the orchestrator's interpreter thread. Producers
/// enqueue without blocking; removal commands carry a future the
/// interpreter resolves once the command ran.
pub(crate) enum Command {
    RegisterLeaf {
        leaf: Arc<Routine>,
    },
    RegisterGroup {
        group: Arc<Group>,
    },
    RegisterGroupByName {
        name: String,
    },
    RegisterLeafInGroup {
        leaf: Arc<Routine>,
        group: Arc<Group>,
    },
    RegisterLeafInNamedGroup {
        leaf: Arc<Routine>,
        group: String,
    },
    RemoveLeaf {
        leaf: Arc<Routine>,
        reply: OpFuture<Arc<dyn Node>>,
    },
    RemoveGroup {
        group: Arc<Group>,
        reply: OpFuture<Arc<dyn Node>>,
    },
    RemoveGroupByName {
        name: String,
        reply: OpFuture<Arc<dyn Node>>,
    },
    RemoveLeafFromGroup {
        leaf: Arc<Routine>,
        group: Arc<Group>,
        reply: OpFuture<Arc<dyn Node>>,
    },
    RemoveLeafFromNamedGroup {
        leaf: Arc<Routine>,
        group: String,
        reply: OpFuture<Arc<dyn Node>>,
    },
    SetFrequency {
        frequency: u64,
    },
    Exit {
        end_process: bool,
    },
    Trigger {
        request: ControlRequest,
        pattern: Regex,
    },
}

impl Command {
    /// Stable numeric opcode, used for log correlation only.
    pub(crate) fn opcode(&self) -> u16 {
        match self {
            Self::RegisterLeaf { .. } => 100,
            Self::RegisterGroup { .. } => 101,
            Self::RegisterGroupByName { .. } => 102,
            Self::RegisterLeafInGroup { .. } => 103,
            Self::RegisterLeafInNamedGroup { .. } => 104,
            Self::RemoveLeaf { .. } => 200,
            Self::RemoveGroup { .. } => 201,
            Self::RemoveGroupByName { .. } => 202,
            Self::RemoveLeafFromGroup { .. } => 203,
            Self::RemoveLeafFromNamedGroup { .. } => 204,
            Self::SetFrequency { .. } => 300,
            Self::Exit { .. } => 302,
            Self::Trigger { request, .. } => match request {
                ControlRequest::Execute => 400,
                ControlRequest::Pause => 401,
                ControlRequest::Stop => 402,
                ControlRequest::Shutdown => 403,
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::RegisterLeaf { .. } => "RegisterLeaf",
            Self::RegisterGroup { .. } => "RegisterGroup",
            Self::RegisterGroupByName { .. } => "RegisterGroupByName",
            Self::RegisterLeafInGroup { .. } => "RegisterLeafInGroup",
            Self::RegisterLeafInNamedGroup { .. } => "RegisterLeafInNamedGroup",
            Self::RemoveLeaf { .. } => "RemoveLeaf",
            Self::RemoveGroup { .. } => "RemoveGroup",
            Self::RemoveGroupByName { .. } => "RemoveGroupByName",
            Self::RemoveLeafFromGroup { .. } => "RemoveLeafFromGroup",
            Self::RemoveLeafFromNamedGroup { .. } => "RemoveLeafFromNamedGroup",
            Self::SetFrequency { .. } => "SetFrequency",
            Self::Exit { .. } => "Exit",
            Self::Trigger { .. } => "Trigger",
        }
    }

    /// Resolve any pending removal future to `None`. Called for
    /// commands left in the queue when the interpreter winds down, so
    /// no producer blocks forever.
    pub(crate) fn abandon(self) {
        match self {
            Self::RemoveLeaf { reply, .. }
            | Self::RemoveGroup { reply, .. }
            | Self::RemoveGroupByName { reply, .. }
            | Self::RemoveLeafFromGroup { reply, .. }
            | Self::RemoveLeafFromNamedGroup { reply, .. } => reply.complete(None),
            _ => {}
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.opcode())
    }
}
