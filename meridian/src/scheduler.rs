//! The cooperative scheduler.
//!
//! A [`Scheduler`] owns a flattened [`RuntimePlan`] and drives it with a
//! single-threaded loop: refresh tick readiness, select a node through the
//! banded fair queue, deliver a batch of messages or one tick, cooperate
//! with backpressure, and park when nothing is runnable. Runtime mutators
//! and shutdown may be called from any thread through a
//! [`SchedulerHandle`]; they land in a mailbox and apply at iteration
//! boundaries.
//!
//! Lifecycle: `Created -> Starting -> Running -> Draining -> Stopped`.
//! `on_start` runs producers-first, `on_stop` exactly once per node in
//! reverse order, and `run` returns only after the graph has stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, RuntimeError};
use crate::logging::{
    LoopTickEvent, MeridianEvent, MeridianLogger, NodeErrorEvent, NodeStartEvent, NodeStopEvent,
    NodeTickEvent, SchedulerShutdownEvent, SchedulerStartEvent, STREAM,
};
use crate::message::Message;
use crate::metrics::{Metrics, NoopMetrics, SchedulerMetrics};
use crate::node::{HookKind, Node, NodeContext};
use crate::plan::{EdgeInfo, RuntimePlan};
use crate::policy::PutResult;
use crate::scheduling::waker::{Command, Mailbox, Waker};
use crate::scheduling::{Band, NodeState, ReadyQueue};
use crate::subgraph::Subgraph;
use crate::trace::{NoopTracer, Tracer};

/// Scheduler configuration.
///
/// Field names and defaults are part of the public contract; all fields
/// deserialize with their defaults when omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base cadence for tick readiness, in milliseconds.
    pub tick_interval_ms: u64,
    /// Service weights for the Control, High, and Normal bands.
    pub fairness_ratio: (u32, u32, u32),
    /// Maximum messages (or one tick) processed per node visit.
    pub max_batch_per_node: usize,
    /// Sleep when nothing is runnable, in milliseconds. The loop never
    /// busy-spins.
    pub idle_sleep_ms: u64,
    /// Upper bound for the graceful drain, in seconds.
    pub shutdown_timeout_s: f64,
    /// What to do when a node hook reports an error.
    pub node_error_policy: NodeErrorPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval_ms: 50,
            fairness_ratio: (4, 2, 1),
            max_batch_per_node: 8,
            idle_sleep_ms: 1,
            shutdown_timeout_s: 2.0,
            node_error_policy: NodeErrorPolicy::Continue,
        }
    }
}

impl SchedulerConfig {
    /// Rejects degenerate configurations.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_batch_per_node == 0 {
            return Err(RuntimeError::invalid("max_batch_per_node must be positive"));
        }
        let (c, h, n) = self.fairness_ratio;
        if c == 0 && h == 0 && n == 0 {
            return Err(RuntimeError::invalid("fairness_ratio must have a nonzero weight"));
        }
        if !self.shutdown_timeout_s.is_finite() || self.shutdown_timeout_s < 0.0 {
            return Err(RuntimeError::invalid("shutdown_timeout_s must be non-negative"));
        }
        Ok(())
    }

    /// The tick cadence as a duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The idle sleep as a duration.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// The drain bound as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_timeout_s).unwrap_or(Duration::from_secs(2))
    }
}

/// Reaction to an error escaping a node hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorPolicy {
    /// Report, count, and keep the node running.
    #[default]
    Continue,
    /// Report, count, and remove the node from scheduling. Its `on_stop`
    /// still runs at shutdown.
    Quiesce,
    /// Report, quiesce the node, and begin a graceful shutdown of the
    /// whole graph.
    Fatal,
}

/// Lifecycle state of a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Built, not yet run.
    Created,
    /// Running `on_start` hooks.
    Starting,
    /// Main loop executing.
    Running,
    /// Shutdown requested; delivering what is in flight.
    Draining,
    /// Terminal; `on_stop` hooks have run.
    Stopped,
}

impl SchedulerState {
    fn as_u8(self) -> u8 {
        match self {
            SchedulerState::Created => 0,
            SchedulerState::Starting => 1,
            SchedulerState::Running => 2,
            SchedulerState::Draining => 3,
            SchedulerState::Stopped => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Created,
            1 => SchedulerState::Starting,
            2 => SchedulerState::Running,
            3 => SchedulerState::Draining,
            _ => SchedulerState::Stopped,
        }
    }
}

/// A point-in-time snapshot of scheduler activity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Current lifecycle state.
    pub state: SchedulerState,
    /// Loop iterations since `run` began, idle iterations included.
    pub iterations: u64,
    /// Messages delivered to node hooks.
    pub messages_delivered: u64,
    /// Ticks delivered to node hooks.
    pub ticks_delivered: u64,
    /// Errors reported by node hooks.
    pub node_errors: u64,
    /// Messages discarded because draining timed out.
    pub discarded_on_shutdown: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared control block: the only cross-thread surface of a scheduler.
pub(crate) struct Control {
    state: AtomicU8,
    shutdown: AtomicBool,
    mailbox: Mailbox,
    waker: Waker,
    edges: Mutex<HashMap<String, usize>>,
    inputs: Mutex<HashMap<String, usize>>,
    iterations: AtomicU64,
    messages: AtomicU64,
    ticks: AtomicU64,
    errors: AtomicU64,
    discarded: AtomicU64,
}

impl Control {
    fn new() -> Self {
        Control {
            state: AtomicU8::new(SchedulerState::Created.as_u8()),
            shutdown: AtomicBool::new(false),
            mailbox: Mailbox::default(),
            waker: Waker::default(),
            edges: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            iterations: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Starting | SchedulerState::Running | SchedulerState::Draining
        )
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            state: self.state(),
            iterations: self.iterations.load(Ordering::Relaxed),
            messages_delivered: self.messages.load(Ordering::Relaxed),
            ticks_delivered: self.ticks.load(Ordering::Relaxed),
            node_errors: self.errors.load(Ordering::Relaxed),
            discarded_on_shutdown: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn set_capacity(&self, edge_id: &str, capacity: usize) -> Result<(), RuntimeError> {
        if capacity == 0 {
            return Err(RuntimeError::invalid("capacity must be positive"));
        }
        let edge = *lock(&self.edges)
            .get(edge_id)
            .ok_or_else(|| RuntimeError::invalid(format!("unknown edge id '{edge_id}'")))?;
        self.mailbox.push(Command::SetCapacity { edge, capacity });
        self.waker.wake();
        Ok(())
    }

    fn set_priority(&self, edge_id: &str, band: Band) -> Result<(), RuntimeError> {
        let edge = *lock(&self.edges)
            .get(edge_id)
            .ok_or_else(|| RuntimeError::invalid(format!("unknown edge id '{edge_id}'")))?;
        self.mailbox.push(Command::SetPriority { edge, band });
        self.waker.wake();
        Ok(())
    }

    fn inject(&self, input: &str, message: Message) -> Result<(), RuntimeError> {
        if matches!(self.state(), SchedulerState::Draining | SchedulerState::Stopped) {
            return Err(RuntimeError::invalid(
                "scheduler is shutting down; external input refused",
            ));
        }
        let edge = *lock(&self.inputs)
            .get(input)
            .ok_or_else(|| RuntimeError::invalid(format!("no exposed input named '{input}'")))?;
        self.mailbox.push(Command::Inject { edge, message });
        self.waker.wake();
        Ok(())
    }
}

/// A cloneable, thread-safe handle to a running (or not yet running)
/// scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: Arc<Control>,
}

impl SchedulerHandle {
    /// Signals the loop to stop accepting external inputs and begin
    /// draining. Idempotent.
    pub fn shutdown(&self) {
        self.control.request_shutdown();
    }

    /// True from the start of `on_start` until `run` returns.
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.control.state()
    }

    /// A snapshot of scheduler activity.
    pub fn stats(&self) -> SchedulerStats {
        self.control.stats()
    }

    /// Resizes an edge at the next iteration boundary. Raising capacity
    /// unblocks producers parked on the edge.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] for an unknown edge id or a zero
    /// capacity; nothing is changed.
    pub fn set_capacity(&self, edge_id: &str, capacity: usize) -> Result<(), RuntimeError> {
        self.control.set_capacity(edge_id, capacity)
    }

    /// Moves an edge to another priority band at the next iteration
    /// boundary.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] for an unknown edge id; nothing is
    /// changed.
    pub fn set_priority(&self, edge_id: &str, band: Band) -> Result<(), RuntimeError> {
        self.control.set_priority(edge_id, band)
    }

    /// Delivers a message from outside the graph onto an exposed input.
    /// Applied at an iteration boundary; while the target edge is full
    /// under Block, delivery is retried on later boundaries.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] for an unknown input name, or once
    /// the scheduler is draining or stopped.
    pub fn inject(&self, input: &str, message: Message) -> Result<(), RuntimeError> {
        self.control.inject(input, message)
    }
}

/// The cooperative loop driving a registered graph.
pub struct Scheduler {
    config: SchedulerConfig,
    plan: RuntimePlan,
    ready: ReadyQueue,
    states: Vec<NodeState>,
    waiters: Vec<Vec<usize>>,
    pending_injections: VecDeque<(usize, Message)>,
    control: Arc<Control>,
    registry: meridian_logging::Registry,
    logger: Option<MeridianLogger>,
    metrics: Arc<dyn Metrics>,
    tracer: Arc<dyn Tracer>,
    sched_metrics: SchedulerMetrics,
    scratch: Vec<Command>,
}

impl Scheduler {
    /// Creates a scheduler with no-op observability.
    pub fn new(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let sched_metrics = SchedulerMetrics::bind(metrics.as_ref());
        Ok(Scheduler {
            ready: ReadyQueue::new(config.fairness_ratio),
            config,
            plan: RuntimePlan::new(),
            states: Vec::new(),
            waiters: Vec::new(),
            pending_injections: VecDeque::new(),
            control: Arc::new(Control::new()),
            registry: meridian_logging::Registry::new(Instant::now()),
            logger: None,
            metrics,
            tracer: Arc::new(NoopTracer),
            sched_metrics,
            scratch: Vec::new(),
        })
    }

    /// Installs a metrics backend. Call before registering graphs; handles
    /// are pre-bound at registration.
    pub fn set_metrics(&mut self, metrics: Arc<dyn Metrics>) -> &mut Self {
        self.sched_metrics = SchedulerMetrics::bind(metrics.as_ref());
        self.metrics = metrics;
        self
    }

    /// Installs a tracer backend.
    pub fn set_tracer(&mut self, tracer: Arc<dyn Tracer>) -> &mut Self {
        self.tracer = tracer;
        self
    }

    /// Access to the event stream registry. Install an action for
    /// [`STREAM`] before registering graphs; edge loggers are cloned at
    /// registration time.
    pub fn log_register(&mut self) -> &mut meridian_logging::Registry {
        &mut self.registry
    }

    /// A thread-safe handle for shutdown, mutators, and stats.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Flattens a subgraph into the runtime plan.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Validation`] with the aggregated issue list when the
    /// graph has any error-severity issue; the plan is left untouched and
    /// nothing starts. Warnings are logged and tolerated.
    pub fn register(&mut self, graph: Subgraph) -> Result<(), RuntimeError> {
        if self.control.state() != SchedulerState::Created {
            return Err(RuntimeError::invalid("graphs must be registered before run"));
        }
        self.logger = self.registry.get::<MeridianEvent>(STREAM);
        let warnings = self
            .plan
            .absorb(graph, self.metrics.as_ref(), self.logger.as_ref())?;
        for issue in &warnings {
            tracing::warn!(code = issue.code.as_str(), "{}", issue.message);
        }
        *lock(&self.control.edges) = self.plan.edge_index.clone();
        *lock(&self.control.inputs) = self.plan.external_inputs.clone();
        Ok(())
    }

    /// Registers a single node as its own one-node graph.
    pub fn register_node(
        &mut self,
        name: impl Into<String>,
        node: impl Node + 'static,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        let mut graph = Subgraph::new(name.clone());
        graph.add_node(name, node);
        self.register(graph)
    }

    /// Attaches an external subscriber to an exposed output.
    pub fn subscribe_output(&mut self, name: &str) -> Result<Receiver<Message>, RuntimeError> {
        self.plan.subscribe_output(name)
    }

    /// Read-only descriptions of every edge.
    pub fn edges(&self) -> Vec<EdgeInfo> {
        self.plan.edge_infos()
    }

    /// Read-only description of one edge.
    pub fn edge_info(&self, edge_id: &str) -> Option<EdgeInfo> {
        let &index = self.plan.edge_index.get(edge_id)?;
        self.plan.edge_infos().into_iter().nth(index)
    }

    /// See [`SchedulerHandle::shutdown`].
    pub fn shutdown(&self) {
        self.control.request_shutdown();
    }

    /// See [`SchedulerHandle::is_running`].
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// See [`SchedulerHandle::stats`].
    pub fn stats(&self) -> SchedulerStats {
        self.control.stats()
    }

    /// See [`SchedulerHandle::set_capacity`].
    pub fn set_capacity(&self, edge_id: &str, capacity: usize) -> Result<(), RuntimeError> {
        self.control.set_capacity(edge_id, capacity)
    }

    /// See [`SchedulerHandle::set_priority`].
    pub fn set_priority(&self, edge_id: &str, band: Band) -> Result<(), RuntimeError> {
        self.control.set_priority(edge_id, band)
    }

    /// See [`SchedulerHandle::inject`].
    pub fn inject(&self, input: &str, message: Message) -> Result<(), RuntimeError> {
        self.control.inject(input, message)
    }

    /// Runs the graph until a graceful stop. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// Only initialization can fail: a second `run` reports
    /// [`RuntimeError::InvalidArgument`]. Node errors, policy errors, and
    /// drain timeouts are reported through observability and stats, and
    /// `run` still returns `Ok`.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        if self.control.state() != SchedulerState::Created {
            return Err(RuntimeError::invalid("scheduler can only run once"));
        }
        let started = Instant::now();
        self.control.waker.arm();
        self.control.set_state(SchedulerState::Starting);
        tracing::info!(
            nodes = self.plan.nodes.len(),
            edges = self.plan.edges.len(),
            "scheduler starting"
        );
        if let Some(logger) = &self.logger {
            logger.log(SchedulerStartEvent {
                nodes: self.plan.nodes.len(),
                edges: self.plan.edges.len(),
            });
        }

        let node_count = self.plan.nodes.len();
        self.ready.resize(node_count);
        self.states = vec![NodeState::default(); node_count];
        self.waiters = vec![Vec::new(); self.plan.edges.len()];

        let topo = self.plan.topo.clone();
        for &index in &topo {
            self.invoke_lifecycle_hook(index, HookKind::Start);
        }
        let now = Instant::now();
        for (index, state) in self.states.iter_mut().enumerate() {
            let interval = self.plan.nodes[index]
                .tick_interval
                .unwrap_or_else(|| self.config.tick_interval());
            state.next_tick = Some(now + interval);
        }
        self.control.set_state(SchedulerState::Running);

        let mut drain_deadline: Option<Instant> = None;
        let mut timed_out = false;
        loop {
            let iter_started = Instant::now();
            self.apply_commands();
            self.retry_injections();

            if self.control.shutdown_requested()
                && self.control.state() == SchedulerState::Running
            {
                self.control.set_state(SchedulerState::Draining);
                let timeout = self.config.shutdown_timeout();
                drain_deadline = Some(Instant::now() + timeout);
                tracing::info!(?timeout, "shutdown requested; draining");
                if let Some(logger) = &self.logger {
                    logger.log(SchedulerShutdownEvent { timeout });
                }
            }

            if self.control.state() == SchedulerState::Draining {
                if self.plan.all_edges_empty() {
                    break;
                }
                if drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    timed_out = true;
                    break;
                }
            }

            self.refresh_ticks();

            if let Some((index, _band)) = self.ready.pop() {
                self.visit(index);
            } else if !self.control.mailbox.is_pending() {
                std::thread::park_timeout(self.config.idle_sleep());
            }

            self.finish_iteration(iter_started);
        }

        if timed_out {
            let mut discarded = 0;
            for cell in &self.plan.edges {
                discarded += cell.borrow_mut().discard_remaining();
            }
            self.control.discarded.fetch_add(discarded, Ordering::Relaxed);
            let report = RuntimeError::ShutdownTimeout { discarded };
            tracing::warn!("{report}");
        }

        self.control.set_state(SchedulerState::Stopped);
        for &index in topo.iter().rev() {
            self.invoke_lifecycle_hook(index, HookKind::Stop);
        }
        self.registry.flush();
        self.control.waker.disarm();
        // Release the plan: edges, buffers, and node boxes drop here.
        self.plan = RuntimePlan::new();
        tracing::info!(elapsed = ?started.elapsed(), "scheduler stopped");
        Ok(())
    }

    fn finish_iteration(&self, iter_started: Instant) {
        let iteration = self.control.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        self.sched_metrics
            .loop_latency
            .observe(iter_started.elapsed().as_secs_f64());
        for band in Band::ALL {
            self.sched_metrics.runnable[band.index()].set(self.ready.len_in(band) as f64);
        }
        if let Some(logger) = &self.logger {
            logger.log(LoopTickEvent {
                iteration,
                runnable: self.ready.len(),
            });
        }
    }

    fn apply_commands(&mut self) {
        let mut commands = std::mem::take(&mut self.scratch);
        self.control.mailbox.drain(&mut commands);
        for command in commands.drain(..) {
            match command {
                Command::SetCapacity { edge, capacity } => {
                    if edge >= self.plan.edges.len() {
                        continue;
                    }
                    let can_accept = {
                        let mut cell = self.plan.edges[edge].borrow_mut();
                        cell.set_capacity(capacity);
                        cell.depth() < capacity
                    };
                    tracing::debug!(edge, capacity, "edge capacity updated");
                    if can_accept {
                        self.unblock(edge);
                    }
                }
                Command::SetPriority { edge, band } => {
                    if edge >= self.plan.edges.len() {
                        continue;
                    }
                    self.plan.edges[edge].borrow_mut().set_band(band);
                    self.sched_metrics.priority_applied[band.index()].inc();
                    tracing::debug!(edge, band = band.as_str(), "edge priority updated");
                }
                Command::Inject { edge, message } => {
                    self.pending_injections.push_back((edge, message));
                }
            }
        }
        self.scratch = commands;
    }

    fn retry_injections(&mut self) {
        if self.pending_injections.is_empty() {
            return;
        }
        let mut remaining = VecDeque::new();
        while let Some((edge_ix, message)) = self.pending_injections.pop_front() {
            let outcome = {
                let mut edge = self.plan.edges[edge_ix].borrow_mut();
                edge.try_put(message.clone(), None)
                    .map(|result| (result, edge.dst(), edge.band()))
            };
            match outcome {
                Ok((PutResult::Blocked, _, _)) => remaining.push_back((edge_ix, message)),
                Ok((result, dst, band)) => {
                    if result.is_accepted()
                        && !self.states[dst].quiesced
                        && !self.states[dst].is_blocked()
                    {
                        self.ready.push(dst, band);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "injected message rejected");
                }
            }
        }
        self.pending_injections = remaining;
    }

    fn refresh_ticks(&mut self) {
        let now = Instant::now();
        for index in 0..self.states.len() {
            let state = &mut self.states[index];
            if state.quiesced {
                continue;
            }
            let Some(due) = state.next_tick else { continue };
            if now < due {
                continue;
            }
            // At most one pending tick per node; missed cadences are not
            // queued up.
            let interval = self.plan.nodes[index]
                .tick_interval
                .unwrap_or_else(|| self.config.tick_interval());
            state.next_tick = Some(now + interval);
            if !state.tick_ready {
                state.tick_ready = true;
                if state.blocked_on.is_none() {
                    self.ready.push(index, Band::Normal);
                }
            }
        }
    }

    fn visit(&mut self, index: usize) {
        if self.states[index].quiesced {
            return;
        }
        let stage = self.control.state();
        let batch = self.config.max_batch_per_node;

        let mut delivered = 0usize;
        while delivered < batch {
            let Some((edge_ix, port_ix)) = self.pick_input(index) else {
                break;
            };
            let msg = self.plan.edges[edge_ix].borrow_mut().try_get();
            let Some(msg) = msg else { break };
            self.unblock(edge_ix);

            self.plan.nodes[index].metrics.messages.inc();
            self.control.messages.fetch_add(1, Ordering::Relaxed);
            delivered += 1;

            if let Err(error) = self.invoke_message_hook(index, port_ix, msg, stage) {
                self.handle_node_error(index, HookKind::Message, error);
                if self.states[index].quiesced {
                    break;
                }
            }
            if self.states[index].blocked_on.is_some() {
                // Emit hit a full Block edge: yield the rest of the batch.
                break;
            }
        }

        if delivered == 0 && self.states[index].tick_ready {
            self.states[index].tick_ready = false;
            let timer = Instant::now();
            let result = self.invoke_tick_hook(index, stage);
            self.plan.nodes[index]
                .metrics
                .tick_duration
                .observe(timer.elapsed().as_secs_f64());
            self.control.ticks.fetch_add(1, Ordering::Relaxed);
            if let Some(logger) = &self.logger {
                logger.log(NodeTickEvent { id: index });
            }
            if let Err(error) = result {
                self.handle_node_error(index, HookKind::Tick, error);
            }
        }

        let state = &self.states[index];
        if !state.quiesced && state.blocked_on.is_none() {
            if let Some(band) = self.effective_band(index) {
                self.ready.push(index, band);
            }
        }
    }

    /// The highest-priority non-empty input edge of a node, if any.
    fn pick_input(&self, index: usize) -> Option<(usize, usize)> {
        let entry = &self.plan.nodes[index];
        let mut best: Option<(Band, usize, usize)> = None;
        for (port_ix, input) in entry.inputs.iter().enumerate() {
            for &edge_ix in &input.edges {
                let edge = self.plan.edges[edge_ix].borrow();
                if edge.is_empty() {
                    continue;
                }
                let band = edge.band();
                let better = match best {
                    None => true,
                    Some((current, _, _)) => band < current,
                };
                if better {
                    best = Some((band, edge_ix, port_ix));
                }
            }
        }
        best.map(|(_, edge_ix, port_ix)| (edge_ix, port_ix))
    }

    /// The band a node would re-enter the ready queue with: the highest
    /// band among its non-empty inputs, else Normal when only tick-ready.
    fn effective_band(&self, index: usize) -> Option<Band> {
        let entry = &self.plan.nodes[index];
        let mut best: Option<Band> = None;
        for input in &entry.inputs {
            for &edge_ix in &input.edges {
                let edge = self.plan.edges[edge_ix].borrow();
                if edge.is_empty() {
                    continue;
                }
                let band = edge.band();
                best = Some(match best {
                    Some(current) if current <= band => current,
                    _ => band,
                });
            }
        }
        if best.is_none() && self.states[index].tick_ready {
            best = Some(Band::Normal);
        }
        best
    }

    /// Releases producers parked on an edge whose depth just decreased or
    /// whose capacity grew, observing the blocked interval.
    fn unblock(&mut self, edge_ix: usize) {
        if self.waiters[edge_ix].is_empty() {
            return;
        }
        let waiters = std::mem::take(&mut self.waiters[edge_ix]);
        let now = Instant::now();
        for node in waiters {
            if self.states[node].blocked_on != Some(edge_ix) {
                continue;
            }
            self.states[node].blocked_on = None;
            if let Some(since) = self.states[node].blocked_since.take() {
                self.plan.edges[edge_ix]
                    .borrow()
                    .blocked_time()
                    .observe(now.saturating_duration_since(since).as_secs_f64());
            }
            if let Some(band) = self.effective_band(node) {
                self.ready.push(node, band);
            }
        }
    }

    fn invoke_message_hook(
        &mut self,
        index: usize,
        port_ix: usize,
        msg: Message,
        stage: SchedulerState,
    ) -> Result<(), NodeError> {
        let Scheduler {
            plan,
            ready,
            states,
            control,
            tracer,
            ..
        } = self;
        let entry = &plan.nodes[index];
        let port_name = entry.inputs[port_ix].spec.name();
        tracer.set_trace_id(msg.headers().trace_id());
        let _span = tracer.start_span(
            "node.on_message",
            &[("node", entry.name.as_str()), ("port", port_name)],
        );
        let mut ctx = NodeContext {
            index,
            name: &entry.name,
            outputs: &entry.outputs,
            edges: &plan.edges,
            ready,
            states: states.as_mut_slice(),
            control: control.as_ref(),
            stage,
        };
        let mut node = entry.node.borrow_mut();
        let result = node.on_message(&mut ctx, port_name, msg);
        drop(node);
        // A producer that just blocked parks until the edge moves.
        if let Some(edge_ix) = self.states[index].blocked_on {
            self.waiters[edge_ix].push(index);
        }
        result
    }

    fn invoke_tick_hook(&mut self, index: usize, stage: SchedulerState) -> Result<(), NodeError> {
        let Scheduler {
            plan,
            ready,
            states,
            control,
            tracer,
            ..
        } = self;
        let entry = &plan.nodes[index];
        let _span = tracer.start_span("node.on_tick", &[("node", entry.name.as_str())]);
        let mut ctx = NodeContext {
            index,
            name: &entry.name,
            outputs: &entry.outputs,
            edges: &plan.edges,
            ready,
            states: states.as_mut_slice(),
            control: control.as_ref(),
            stage,
        };
        let mut node = entry.node.borrow_mut();
        let result = node.on_tick(&mut ctx);
        drop(node);
        if let Some(edge_ix) = self.states[index].blocked_on {
            self.waiters[edge_ix].push(index);
        }
        result
    }

    fn invoke_lifecycle_hook(&mut self, index: usize, kind: HookKind) {
        let stage = self.control.state();
        let result = {
            let Scheduler {
                plan,
                ready,
                states,
                control,
                tracer,
                ..
            } = self;
            let entry = &plan.nodes[index];
            let span_name = match kind {
                HookKind::Start => "node.on_start",
                _ => "node.on_stop",
            };
            let _span = tracer.start_span(span_name, &[("node", entry.name.as_str())]);
            tracing::debug!(node = entry.name.as_str(), hook = kind.as_str(), "lifecycle hook");
            let mut ctx = NodeContext {
                index,
                name: &entry.name,
                outputs: &entry.outputs,
                edges: &plan.edges,
                ready,
                states: states.as_mut_slice(),
                control: control.as_ref(),
                stage,
            };
            let mut node = entry.node.borrow_mut();
            match kind {
                HookKind::Start => node.on_start(&mut ctx),
                _ => node.on_stop(&mut ctx),
            }
        };
        if let Some(edge_ix) = self.states[index].blocked_on {
            if !self.waiters[edge_ix].contains(&index) {
                self.waiters[edge_ix].push(index);
            }
        }
        if let Some(logger) = &self.logger {
            match kind {
                HookKind::Start => logger.log(NodeStartEvent { id: index }),
                _ => logger.log(NodeStopEvent { id: index }),
            }
        }
        if let Err(error) = result {
            self.handle_node_error(index, kind, error);
        }
    }

    fn handle_node_error(&mut self, index: usize, hook: HookKind, error: NodeError) {
        let name = self.plan.nodes[index].name.as_str();
        tracing::error!(node = name, hook = hook.as_str(), error = %error, "node hook failed");
        self.plan.nodes[index].metrics.errors.inc();
        self.control.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(logger) = &self.logger {
            logger.log(NodeErrorEvent {
                id: index,
                hook,
                error: error.to_string(),
            });
        }
        match self.config.node_error_policy {
            NodeErrorPolicy::Continue => {}
            NodeErrorPolicy::Quiesce => {
                self.states[index].quiesced = true;
            }
            NodeErrorPolicy::Fatal => {
                self.states[index].quiesced = true;
                self.control.request_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn default_config_matches_contract() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.fairness_ratio, (4, 2, 1));
        assert_eq!(config.max_batch_per_node, 8);
        assert_eq!(config.idle_sleep_ms, 1);
        assert_eq!(config.shutdown_timeout_s, 2.0);
        assert_eq!(config.node_error_policy, NodeErrorPolicy::Continue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn degenerate_configs_rejected() {
        let mut config = SchedulerConfig::default();
        config.max_batch_per_node = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.fairness_ratio = (0, 0, 0);
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.shutdown_timeout_s = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str("{}").expect("all fields default");
        assert_eq!(config, SchedulerConfig::default());
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"tick_interval_ms": 5}"#).expect("partial config");
        assert_eq!(config.tick_interval_ms, 5);
        assert_eq!(config.max_batch_per_node, 8);
    }

    #[test]
    fn mutators_validate_before_queueing() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("default is valid");
        let handle = scheduler.handle();
        assert!(handle.set_capacity("ghost:out->b:in", 4).is_err());
        assert!(handle.set_priority("ghost:out->b:in", Band::Control).is_err());
        assert!(handle.inject("ghost", Message::data(1u8)).is_err());
    }

    #[test]
    fn run_twice_is_refused() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default()).expect("default is valid");
        scheduler.shutdown();
        scheduler.run().expect("empty graph drains instantly");
        assert!(scheduler.run().is_err());
        assert_eq!(scheduler.stats().state, SchedulerState::Stopped);
    }
}
