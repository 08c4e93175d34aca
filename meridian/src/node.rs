//! The node lifecycle contract and the emit capability handed to hooks.
//!
//! A [`Node`] is a user-defined processing unit. The scheduler drives its
//! hooks in a fixed order: `on_start` once, then any number of `on_message`
//! and `on_tick` calls, then `on_stop` exactly once. Hooks receive a
//! [`NodeContext`], a borrow-scoped capability for emitting messages; nodes
//! never own edges and must not stash the context.

use std::cell::RefCell;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::error::{NodeError, RuntimeError};
use crate::message::Message;
use crate::plan::OutputPort;
use crate::policy::PutResult;
use crate::ports::PortSpec;
use crate::scheduler::{Control, SchedulerState};
use crate::scheduling::{NodeState, ReadyQueue};

/// Identifies the lifecycle hook an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookKind {
    /// `on_start`.
    Start,
    /// `on_message`.
    Message,
    /// `on_tick`.
    Tick,
    /// `on_stop`.
    Stop,
}

impl HookKind {
    /// Stable lowercase name, used in events and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Start => "on_start",
            HookKind::Message => "on_message",
            HookKind::Tick => "on_tick",
            HookKind::Stop => "on_stop",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for node lifecycle hooks.
///
/// An `Err` is caught by the scheduler, reported as a `node.error` event,
/// counted, and handled per the configured
/// [`NodeErrorPolicy`](crate::scheduler::NodeErrorPolicy); it does not stop
/// the graph by default.
pub type HookResult = Result<(), NodeError>;

/// A user-defined processing unit.
///
/// All methods have defaults, so a node implements only what it needs.
/// Hooks run on the scheduler thread and must not block: long or blocking
/// work delays every other node and, eventually, shutdown. Offload blocking
/// I/O to your own threads and feed results back through an exposed input.
///
/// # Examples
///
/// ```
/// use meridian::{HookResult, Message, Node, NodeContext, PortSpec};
///
/// /// Forwards every payload, counting as it goes.
/// struct Relay {
///     seen: u64,
/// }
///
/// impl Node for Relay {
///     fn inputs(&self) -> Vec<PortSpec> {
///         vec![PortSpec::new("in")]
///     }
///     fn outputs(&self) -> Vec<PortSpec> {
///         vec![PortSpec::new("out")]
///     }
///     fn on_message(&mut self, ctx: &mut NodeContext<'_>, _port: &str, msg: Message) -> HookResult {
///         self.seen += 1;
///         ctx.emit("out", msg)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Node {
    /// Input ports, unique by name. Called at registration; the set is
    /// fixed for the node's life.
    fn inputs(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Output ports, unique by name. Called at registration; the set is
    /// fixed for the node's life.
    fn outputs(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Preferred tick cadence. `None` uses the scheduler's global
    /// `tick_interval_ms`.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Runs once, before any message or tick. Nodes start in
    /// producers-first order; do not emit toward nodes that start after
    /// this one.
    fn on_start(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        let _ = ctx;
        Ok(())
    }

    /// Runs when a message arrives on an input port.
    ///
    /// Emitting may answer [`PutResult::Blocked`]; the item was *not*
    /// enqueued. Retain it and re-emit when next scheduled — the scheduler
    /// will not run this node again until the blocking edge drains or
    /// grows.
    fn on_message(&mut self, ctx: &mut NodeContext<'_>, port: &str, msg: Message) -> HookResult {
        let _ = (ctx, port, msg);
        Ok(())
    }

    /// Runs periodically. At most one tick is pending at a time; ticks
    /// missed under load are not made up.
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        let _ = ctx;
        Ok(())
    }

    /// Runs exactly once during shutdown, in reverse topological order.
    /// Data emission is refused here; CONTROL messages are permitted.
    fn on_stop(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        let _ = ctx;
        Ok(())
    }
}

/// The capability a hook uses to interact with the runtime.
///
/// Contexts are constructed by the scheduler for the duration of one hook
/// call; the borrow makes it impossible to retain one.
pub struct NodeContext<'a> {
    pub(crate) index: usize,
    pub(crate) name: &'a str,
    pub(crate) outputs: &'a [OutputPort],
    pub(crate) edges: &'a [RefCell<Edge>],
    pub(crate) ready: &'a mut ReadyQueue,
    pub(crate) states: &'a mut [NodeState],
    pub(crate) control: &'a Control,
    pub(crate) stage: SchedulerState,
}

impl NodeContext<'_> {
    /// The name this node was registered under.
    pub fn node_name(&self) -> &str {
        self.name
    }

    /// Sends a message out of a declared output port.
    ///
    /// The message travels to every edge connected to the port, in connect
    /// order, and to any external output subscribers. The returned value is
    /// the first outcome other than [`PutResult::Ok`], if any:
    ///
    /// - [`PutResult::Blocked`] means the item was not enqueued on the
    ///   blocking edge. Stop producing, keep the item, and re-emit when
    ///   next scheduled. The first emit on this port after a Blocked
    ///   outcome is treated as that retry: delivery resumes at the edge
    ///   that blocked, so edges that already accepted the message are not
    ///   delivered to twice.
    /// - Other outcomes are informational; the edge has already applied
    ///   its policy.
    ///
    /// A port with no connected edges reports [`PutResult::Dropped`]
    /// (subscribers, if any, still observe the message).
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] for an undeclared port or a data
    /// emission from `on_stop`; [`RuntimeError::TypeMismatch`] when the
    /// payload fails the destination port's schema.
    pub fn emit(&mut self, port: &str, msg: Message) -> Result<PutResult, RuntimeError> {
        if self.stage == SchedulerState::Stopped && msg.is_data() {
            return Err(RuntimeError::invalid(format!(
                "node '{}' cannot emit data messages from on_stop",
                self.name,
            )));
        }
        let port_ix = self
            .outputs
            .iter()
            .position(|p| p.spec.name() == port)
            .ok_or_else(|| {
                RuntimeError::invalid(format!(
                    "node '{}' has no output port '{port}'",
                    self.name,
                ))
            })?;
        let output = &self.outputs[port_ix];

        // A retry of a blocked fan-out picks up where it left off.
        let start = {
            let state = &mut self.states[self.index];
            match state.resume_emit {
                Some((resume_port, offset)) if resume_port == port_ix => {
                    state.resume_emit = None;
                    offset
                }
                _ => 0,
            }
        };

        if start == 0 {
            for tap in &output.taps {
                // A disconnected subscriber is not this node's problem.
                let _ = tap.send(msg.clone());
            }
        }

        if output.edges.is_empty() {
            let outcome = if output.taps.is_empty() {
                PutResult::Dropped
            } else {
                PutResult::Ok
            };
            return Ok(outcome);
        }

        let mut outcome = PutResult::Ok;
        for (offset, &edge_ix) in output.edges.iter().enumerate().skip(start) {
            let (result, dst, band) = {
                let mut edge = self.edges[edge_ix].borrow_mut();
                let result = edge.try_put(msg.clone(), None)?;
                (result, edge.dst(), edge.band())
            };
            match result {
                PutResult::Blocked => {
                    let state = &mut self.states[self.index];
                    state.blocked_on = Some(edge_ix);
                    state.blocked_since = Some(Instant::now());
                    state.resume_emit = Some((port_ix, offset));
                    return Ok(PutResult::Blocked);
                }
                result => {
                    if result.is_accepted()
                        && !self.states[dst].quiesced
                        && !self.states[dst].is_blocked()
                    {
                        self.ready.push(dst, band);
                    }
                    if outcome == PutResult::Ok && result != PutResult::Ok {
                        outcome = result;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Requests a graceful shutdown of the whole scheduler, as if
    /// `shutdown()` had been called on a handle. Useful for sink nodes that
    /// can tell when the computation is complete.
    pub fn request_shutdown(&self) {
        self.control.request_shutdown();
    }
}
