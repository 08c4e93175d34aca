//! Meridian is an in-process graph dataflow runtime.
//!
//! Applications are directed graphs of [`Node`]s connected by typed,
//! bounded edges, driven by a cooperative [`Scheduler`] that honors
//! priority bands, fairness, and backpressure, and shuts down
//! deterministically.
//!
//! The crate is organized leaves-first, each module depending only on the
//! ones before it:
//!
//! - [`message`]: the immutable envelope (kind, payload, headers).
//! - [`ports`] and [`policy`]: port descriptors, runtime schemas, and the
//!   four overflow policies (Block, Drop, Latest, Coalesce).
//! - [`edge`]: the bounded FIFO applying a policy on enqueue.
//! - [`node`] and [`subgraph`]: the lifecycle contract and the composition
//!   builder with structural validation.
//! - [`plan`] and [`scheduling`]: flat execution tables and the banded
//!   fair ready queue.
//! - [`scheduler`]: the single-threaded loop, runtime mutators, and
//!   graceful shutdown.
//!
//! Observability plugs in at scheduler construction: typed event streams
//! (the re-exported [`logging_core`] registry), a [`Metrics`] seam with
//! pre-bound handles, and a [`Tracer`] seam. All default to no-ops.
//!
//! # Examples
//!
//! A source emits five integers on its tick; a sink records them and asks
//! for shutdown once it has everything. `run` returns after the graph has
//! drained and stopped.
//!
//! ```
//! use meridian::{
//!     Band, HookResult, Message, Node, NodeContext, Policy, PortSpec, Scheduler,
//!     SchedulerConfig, Subgraph,
//! };
//!
//! struct Source {
//!     next: u64,
//! }
//!
//! impl Node for Source {
//!     fn outputs(&self) -> Vec<PortSpec> {
//!         vec![PortSpec::typed::<u64>("out")]
//!     }
//!     fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
//!         if self.next < 5 {
//!             self.next += 1;
//!             ctx.emit("out", Message::data(self.next))?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! struct Sink {
//!     seen: u64,
//! }
//!
//! impl Node for Sink {
//!     fn inputs(&self) -> Vec<PortSpec> {
//!         vec![PortSpec::typed::<u64>("in")]
//!     }
//!     fn on_message(&mut self, ctx: &mut NodeContext<'_>, _port: &str, _msg: Message) -> HookResult {
//!         self.seen += 1;
//!         if self.seen == 5 {
//!             ctx.request_shutdown();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut graph = Subgraph::new("hello");
//! graph.add_node("source", Source { next: 0 });
//! graph.add_node("sink", Sink { seen: 0 });
//! graph.connect_with(("source", "out"), ("sink", "in"), 16, Some(Policy::Block), Band::Normal);
//!
//! let mut config = SchedulerConfig::default();
//! config.tick_interval_ms = 1;
//! let mut scheduler = Scheduler::new(config).expect("valid config");
//! scheduler.register(graph).expect("valid graph");
//! scheduler.run().expect("clean stop");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod message;
pub mod ports;
pub mod policy;
pub mod edge;
pub mod node;
pub mod subgraph;
pub mod plan;
pub mod scheduling;
pub mod scheduler;
pub mod execute;

pub mod logging;
pub mod metrics;
pub mod trace;

/// Re-export of the `meridian_logging` crate.
pub mod logging_core {
    pub use meridian_logging::*;
}

pub use crate::edge::{edge_id, Edge};
pub use crate::error::{NodeError, RuntimeError};
pub use crate::execute::{execute, Execution};
pub use crate::logging::{MeridianEvent, MeridianLogger, STREAM};
pub use crate::message::{Headers, Message, MessageKind, Payload};
pub use crate::metrics::{Counter, Gauge, Histogram, InMemoryMetrics, Metrics, NoopMetrics};
pub use crate::node::{HookKind, HookResult, Node, NodeContext};
pub use crate::plan::EdgeInfo;
pub use crate::policy::{CoalesceFn, Policy, PutResult};
pub use crate::ports::{Direction, Port, PortSpec, Schema};
pub use crate::scheduler::{
    NodeErrorPolicy, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerState, SchedulerStats,
};
pub use crate::scheduling::Band;
pub use crate::subgraph::{Endpoint, Issue, IssueCode, Severity, Subgraph};
pub use crate::trace::{NoopTracer, Span, Tracer};
