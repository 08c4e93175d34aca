//! Convenience entry points for running a graph on a managed thread.
//!
//! [`Scheduler::run`](crate::Scheduler::run) blocks its thread, which is
//! exactly right for a main loop but awkward for tests and embedding.
//! [`execute`] builds the scheduler inside a dedicated thread and hands the
//! caller an [`Execution`] guard with the thread-safe handle.

use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::RuntimeError;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};

/// A running scheduler on its own thread.
///
/// Dropping the guard requests a graceful shutdown and joins the thread, so
/// an `Execution` never outlives its scope silently.
pub struct Execution {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<Result<(), RuntimeError>>>,
}

impl Execution {
    /// The control handle of the running scheduler.
    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// Requests shutdown and waits for `run` to return.
    pub fn join(mut self) -> Result<(), RuntimeError> {
        self.handle.shutdown();
        self.join_thread()
    }

    /// Waits for `run` to return without requesting shutdown; the graph
    /// must stop through some other path (a node calling
    /// `request_shutdown`, or another clone of the handle).
    pub fn wait(mut self) -> Result<(), RuntimeError> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<(), RuntimeError> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::invalid("scheduler thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.handle.shutdown();
            let _ = self.join_thread();
        }
    }
}

/// Builds and runs a scheduler on a dedicated thread.
///
/// The `build` closure runs inside the new thread with a fresh scheduler:
/// install observability, register graphs, subscribe outputs. Once it
/// returns, the scheduler starts and `execute` hands back an [`Execution`].
///
/// # Errors
///
/// Build-time failures (validation, misconfiguration) propagate out of
/// `execute` directly; the thread never starts the graph.
///
/// # Examples
///
/// ```
/// use meridian::{execute, Message, Node, NodeContext, HookResult, PortSpec, Subgraph};
/// use meridian::SchedulerConfig;
///
/// struct Counter {
///     emitted: u64,
/// }
///
/// impl Node for Counter {
///     fn outputs(&self) -> Vec<PortSpec> {
///         vec![PortSpec::new("out")]
///     }
///     fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
///         self.emitted += 1;
///         ctx.emit("out", Message::data(self.emitted))?;
///         if self.emitted >= 3 {
///             ctx.request_shutdown();
///         }
///         Ok(())
///     }
/// }
///
/// let mut config = SchedulerConfig::default();
/// config.tick_interval_ms = 1;
/// let execution = execute(config, |scheduler| {
///     let mut graph = Subgraph::new("demo");
///     graph.add_node("counter", Counter { emitted: 0 });
///     scheduler.register(graph)
/// })
/// .expect("valid graph");
/// execution.wait().expect("clean stop");
/// ```
pub fn execute<F>(config: SchedulerConfig, build: F) -> Result<Execution, RuntimeError>
where
    F: FnOnce(&mut Scheduler) -> Result<(), RuntimeError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("meridian-scheduler".to_owned())
        .spawn(move || {
            let mut scheduler = match Scheduler::new(config) {
                Ok(scheduler) => scheduler,
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                    return Ok(());
                }
            };
            if let Err(error) = build(&mut scheduler) {
                let _ = ready_tx.send(Err(error));
                return Ok(());
            }
            let _ = ready_tx.send(Ok(scheduler.handle()));
            scheduler.run()
        })
        .map_err(|error| RuntimeError::invalid(format!("failed to spawn scheduler thread: {error}")))?;

    match ready_rx.recv() {
        Ok(Ok(handle)) => Ok(Execution {
            handle,
            thread: Some(thread),
        }),
        Ok(Err(error)) => {
            let _ = thread.join();
            Err(error)
        }
        Err(_) => {
            let _ = thread.join();
            Err(RuntimeError::invalid("scheduler thread exited before startup"))
        }
    }
}
