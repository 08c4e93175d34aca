//! Typed runtime events and their stable log keys.
//!
//! The runtime logs structured events to the `"meridian"` stream of its
//! [`Registry`](meridian_logging::Registry). Hot events carry integer node
//! and edge ids; the [`NodeInfoEvent`] and [`EdgeInfoEvent`] declaration
//! events, emitted once at registration, map those ids back to names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::HookKind;
use crate::scheduling::Band;

/// Logger handle for runtime events.
pub type MeridianLogger = meridian_logging::Logger<MeridianEvent>;

/// The stream name the runtime logs to.
///
/// Install an action for this stream before registering graphs; loggers are
/// cloned into edges at registration time.
pub const STREAM: &str = "meridian";

/// Declares a node: maps its integer id to its name.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeInfoEvent {
    /// Plan-wide node index.
    pub id: usize,
    /// The node's registered name.
    pub name: String,
}

/// Declares an edge: maps its integer id to its full identity.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeInfoEvent {
    /// Plan-wide edge index.
    pub id: usize,
    /// Stable edge id, `"<src_node>:<src_port>-><dst_node>:<dst_port>"`.
    pub edge_id: String,
    /// Configured capacity.
    pub capacity: usize,
    /// Overflow policy name.
    pub policy: String,
    /// Priority band at registration.
    pub band: Band,
}

/// A node's `on_start` ran.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeStartEvent {
    /// Plan-wide node index.
    pub id: usize,
}

/// A node's `on_stop` ran.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeStopEvent {
    /// Plan-wide node index.
    pub id: usize,
}

/// A node's `on_tick` ran.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeTickEvent {
    /// Plan-wide node index.
    pub id: usize,
}

/// A node hook reported an error.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeErrorEvent {
    /// Plan-wide node index.
    pub id: usize,
    /// Which hook failed.
    pub hook: HookKind,
    /// Rendered error message.
    pub error: String,
}

/// An edge accepted an item.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeEnqueueEvent {
    /// Plan-wide edge index.
    pub id: usize,
}

/// An edge handed an item to its consumer.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeDequeueEvent {
    /// Plan-wide edge index.
    pub id: usize,
}

/// An edge discarded the incoming item.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeDropEvent {
    /// Plan-wide edge index.
    pub id: usize,
}

/// An edge discarded its oldest item to admit the newest.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeReplaceEvent {
    /// Plan-wide edge index.
    pub id: usize,
}

/// An edge merged the incoming item into its newest queued item.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeCoalesceEvent {
    /// Plan-wide edge index.
    pub id: usize,
}

/// A coalesce merge function failed; the item was dropped.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeCoalesceErrorEvent {
    /// Plan-wide edge index.
    pub id: usize,
    /// Rendered merge error.
    pub error: String,
}

/// A payload failed the destination port's schema.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeValidationFailedEvent {
    /// Plan-wide edge index.
    pub id: usize,
    /// Schema label the port expects.
    pub expected: String,
    /// Concrete type of the rejected payload.
    pub found: String,
}

/// The scheduler began starting nodes.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SchedulerStartEvent {
    /// Number of nodes in the plan.
    pub nodes: usize,
    /// Number of edges in the plan.
    pub edges: usize,
}

/// Shutdown was requested; draining begins.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SchedulerShutdownEvent {
    /// Upper bound for the drain.
    pub timeout: Duration,
}

/// One loop iteration completed.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct LoopTickEvent {
    /// Iteration counter since `run` began.
    pub iteration: u64,
    /// Runnable nodes across all bands after the iteration.
    pub runnable: usize,
}

/// An event in the meridian runtime.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum MeridianEvent {
    /// Node declaration.
    NodeInfo(NodeInfoEvent),
    /// Edge declaration.
    EdgeInfo(EdgeInfoEvent),
    /// Node started.
    NodeStart(NodeStartEvent),
    /// Node stopped.
    NodeStop(NodeStopEvent),
    /// Node ticked.
    NodeTick(NodeTickEvent),
    /// Node hook error.
    NodeError(NodeErrorEvent),
    /// Item accepted by an edge.
    EdgeEnqueue(EdgeEnqueueEvent),
    /// Item dequeued from an edge.
    EdgeDequeue(EdgeDequeueEvent),
    /// Item discarded by an edge.
    EdgeDrop(EdgeDropEvent),
    /// Oldest item replaced by the newest.
    EdgeReplace(EdgeReplaceEvent),
    /// Incoming item coalesced into the newest.
    EdgeCoalesce(EdgeCoalesceEvent),
    /// Coalesce merge failure.
    EdgeCoalesceError(EdgeCoalesceErrorEvent),
    /// Schema rejection at enqueue.
    EdgeValidationFailed(EdgeValidationFailedEvent),
    /// Scheduler startup.
    SchedulerStart(SchedulerStartEvent),
    /// Shutdown requested.
    SchedulerShutdown(SchedulerShutdownEvent),
    /// Loop iteration completed.
    LoopTick(LoopTickEvent),
}

impl MeridianEvent {
    /// The stable log key for this event.
    pub fn key(&self) -> &'static str {
        match self {
            MeridianEvent::NodeInfo(_) => "node.info",
            MeridianEvent::EdgeInfo(_) => "edge.info",
            MeridianEvent::NodeStart(_) => "node.start",
            MeridianEvent::NodeStop(_) => "node.stop",
            MeridianEvent::NodeTick(_) => "node.tick",
            MeridianEvent::NodeError(_) => "node.error",
            MeridianEvent::EdgeEnqueue(_) => "edge.enqueue",
            MeridianEvent::EdgeDequeue(_) => "edge.dequeue",
            MeridianEvent::EdgeDrop(_) => "edge.drop",
            MeridianEvent::EdgeReplace(_) => "edge.replace",
            MeridianEvent::EdgeCoalesce(_) => "edge.coalesce",
            MeridianEvent::EdgeCoalesceError(_) => "edge.coalesce_error",
            MeridianEvent::EdgeValidationFailed(_) => "edge.validation_failed",
            MeridianEvent::SchedulerStart(_) => "scheduler.start",
            MeridianEvent::SchedulerShutdown(_) => "scheduler.shutdown",
            MeridianEvent::LoopTick(_) => "scheduler.loop_tick",
        }
    }
}

impl From<NodeInfoEvent> for MeridianEvent {
    fn from(v: NodeInfoEvent) -> MeridianEvent {
        MeridianEvent::NodeInfo(v)
    }
}

impl From<EdgeInfoEvent> for MeridianEvent {
    fn from(v: EdgeInfoEvent) -> MeridianEvent {
        MeridianEvent::EdgeInfo(v)
    }
}

impl From<NodeStartEvent> for MeridianEvent {
    fn from(v: NodeStartEvent) -> MeridianEvent {
        MeridianEvent::NodeStart(v)
    }
}

impl From<NodeStopEvent> for MeridianEvent {
    fn from(v: NodeStopEvent) -> MeridianEvent {
        MeridianEvent::NodeStop(v)
    }
}

impl From<NodeTickEvent> for MeridianEvent {
    fn from(v: NodeTickEvent) -> MeridianEvent {
        MeridianEvent::NodeTick(v)
    }
}

impl From<NodeErrorEvent> for MeridianEvent {
    fn from(v: NodeErrorEvent) -> MeridianEvent {
        MeridianEvent::NodeError(v)
    }
}

impl From<EdgeEnqueueEvent> for MeridianEvent {
    fn from(v: EdgeEnqueueEvent) -> MeridianEvent {
        MeridianEvent::EdgeEnqueue(v)
    }
}

impl From<EdgeDequeueEvent> for MeridianEvent {
    fn from(v: EdgeDequeueEvent) -> MeridianEvent {
        MeridianEvent::EdgeDequeue(v)
    }
}

impl From<EdgeDropEvent> for MeridianEvent {
    fn from(v: EdgeDropEvent) -> MeridianEvent {
        MeridianEvent::EdgeDrop(v)
    }
}

impl From<EdgeReplaceEvent> for MeridianEvent {
    fn from(v: EdgeReplaceEvent) -> MeridianEvent {
        MeridianEvent::EdgeReplace(v)
    }
}

impl From<EdgeCoalesceEvent> for MeridianEvent {
    fn from(v: EdgeCoalesceEvent) -> MeridianEvent {
        MeridianEvent::EdgeCoalesce(v)
    }
}

impl From<EdgeCoalesceErrorEvent> for MeridianEvent {
    fn from(v: EdgeCoalesceErrorEvent) -> MeridianEvent {
        MeridianEvent::EdgeCoalesceError(v)
    }
}

impl From<EdgeValidationFailedEvent> for MeridianEvent {
    fn from(v: EdgeValidationFailedEvent) -> MeridianEvent {
        MeridianEvent::EdgeValidationFailed(v)
    }
}

impl From<SchedulerStartEvent> for MeridianEvent {
    fn from(v: SchedulerStartEvent) -> MeridianEvent {
        MeridianEvent::SchedulerStart(v)
    }
}

impl From<SchedulerShutdownEvent> for MeridianEvent {
    fn from(v: SchedulerShutdownEvent) -> MeridianEvent {
        MeridianEvent::SchedulerShutdown(v)
    }
}

impl From<LoopTickEvent> for MeridianEvent {
    fn from(v: LoopTickEvent) -> MeridianEvent {
        MeridianEvent::LoopTick(v)
    }
}
