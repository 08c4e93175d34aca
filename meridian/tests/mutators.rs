//! Runtime mutators: validation, iteration-boundary application, and
//! idempotence.

use std::sync::{Arc, Mutex};

use meridian::metrics::names;
use meridian::{
    Band, HookResult, InMemoryMetrics, Message, Node, NodeContext, Policy, PortSpec, Scheduler,
    SchedulerConfig, Subgraph,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test mutex")
}

struct Burst {
    values: Vec<i64>,
    fired: bool,
}

impl Node for Burst {
    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("out")]
    }
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        if !self.fired {
            self.fired = true;
            for &value in &self.values {
                ctx.emit("out", Message::data(value))?;
            }
        }
        Ok(())
    }
}

struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
    stop_after: usize,
}

impl Node for Recorder {
    fn inputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("in")]
    }
    fn on_message(&mut self, ctx: &mut NodeContext<'_>, _port: &str, msg: Message) -> HookResult {
        let value = *msg.downcast_ref::<i64>().ok_or("expected i64 payload")?;
        let mut seen = lock(&self.seen);
        seen.push(value);
        if seen.len() >= self.stop_after {
            ctx.request_shutdown();
        }
        Ok(())
    }
}

fn burst_graph(seen: &Arc<Mutex<Vec<i64>>>, capacity: usize, policy: Policy) -> (Subgraph, String) {
    let mut graph = Subgraph::new("g");
    graph.add_node(
        "a",
        Burst {
            values: vec![1, 2, 3, 4, 5],
            fired: false,
        },
    );
    graph.add_node(
        "b",
        Recorder {
            seen: Arc::clone(seen),
            stop_after: 5,
        },
    );
    let edge = graph.connect_with(("a", "out"), ("b", "in"), capacity, Some(policy), Band::Normal);
    (graph, edge)
}

#[test]
fn unknown_edges_and_bad_values_are_refused() {
    let scheduler = Scheduler::new(SchedulerConfig::default()).expect("valid config");
    let handle = scheduler.handle();
    assert!(handle.set_capacity("nope:x->y:z", 4).is_err());
    assert!(handle.set_priority("nope:x->y:z", Band::High).is_err());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new(SchedulerConfig::default()).expect("valid config");
    let (graph, edge) = burst_graph(&seen, 1, Policy::Drop);
    scheduler.register(graph).expect("valid graph");
    // Known edge, but zero capacity is never legal.
    assert!(scheduler.set_capacity(&edge, 0).is_err());
    assert!(scheduler.set_capacity(&edge, 4).is_ok());
}

#[test]
fn set_capacity_applies_before_the_first_batch() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let metrics = InMemoryMetrics::new();

    // With capacity 1 and Drop, a five-message burst would shed four.
    let (graph, edge) = burst_graph(&seen, 1, Policy::Drop);
    let mut config = SchedulerConfig::default();
    config.tick_interval_ms = 1;
    let mut scheduler = Scheduler::new(config).expect("valid config");
    scheduler.set_metrics(Arc::new(metrics.clone()));
    scheduler.register(graph).expect("valid graph");

    // Queued before run; applied at the first iteration boundary.
    scheduler.set_capacity(&edge, 5).expect("known edge");
    scheduler.run().expect("clean stop");

    assert_eq!(&*lock(&seen), &[1, 2, 3, 4, 5]);
    let labels: &[(&'static str, &str)] = &[("edge_id", edge.as_str())];
    assert_eq!(metrics.counter_value(names::EDGE_DROPPED_TOTAL, labels), 0);
}

#[test]
fn set_capacity_is_idempotent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (graph, edge) = burst_graph(&seen, 1, Policy::Drop);
    let mut config = SchedulerConfig::default();
    config.tick_interval_ms = 1;
    let mut scheduler = Scheduler::new(config).expect("valid config");
    scheduler.register(graph).expect("valid graph");

    scheduler.set_capacity(&edge, 5).expect("known edge");
    scheduler.set_capacity(&edge, 5).expect("repeat is fine");
    scheduler.run().expect("clean stop");

    assert_eq!(&*lock(&seen), &[1, 2, 3, 4, 5]);
}

#[test]
fn set_priority_is_applied_and_counted() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let metrics = InMemoryMetrics::new();

    let (graph, edge) = burst_graph(&seen, 16, Policy::Block);
    let mut config = SchedulerConfig::default();
    config.tick_interval_ms = 1;
    let mut scheduler = Scheduler::new(config).expect("valid config");
    scheduler.set_metrics(Arc::new(metrics.clone()));
    scheduler.register(graph).expect("valid graph");

    scheduler.set_priority(&edge, Band::Control).expect("known edge");
    scheduler.run().expect("clean stop");

    assert_eq!(lock(&seen).len(), 5);
    assert_eq!(
        metrics.counter_value(names::SCHEDULER_PRIORITY_APPLIED_TOTAL, &[("band", "control")]),
        1,
    );
}

/// Emits a backlog, retaining whatever the edge refuses and retrying it
/// when next scheduled, as blocked producers are expected to.
struct RetryingProducer {
    pending: Vec<i64>,
    attempts: Arc<Mutex<u64>>,
}

impl Node for RetryingProducer {
    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("out")]
    }
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        while let Some(&value) = self.pending.first() {
            *lock(&self.attempts) += 1;
            if ctx.emit("out", Message::data(value))?.is_accepted() {
                self.pending.remove(0);
            } else {
                break;
            }
        }
        Ok(())
    }
}

/// Fails `on_start`; under `Quiesce` it is never scheduled, so its input
/// edge only moves when capacity changes.
struct DeafSink;

impl Node for DeafSink {
    fn inputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("in")]
    }
    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) -> HookResult {
        Err("refusing to start".into())
    }
}

#[test]
fn raising_capacity_unblocks_a_parked_producer() {
    let attempts = Arc::new(Mutex::new(0u64));

    let execution = meridian::execute(
        {
            let mut config = SchedulerConfig::default();
            config.tick_interval_ms = 1;
            config.shutdown_timeout_s = 0.2;
            config.node_error_policy = meridian::NodeErrorPolicy::Quiesce;
            config
        },
        {
            let attempts = Arc::clone(&attempts);
            move |scheduler| {
                let mut graph = Subgraph::new("parked");
                graph.add_node(
                    "producer",
                    RetryingProducer {
                        pending: vec![7, 8],
                        attempts,
                    },
                );
                graph.add_node("sink", DeafSink);
                graph.connect_with(("producer", "out"), ("sink", "in"), 1, Some(Policy::Block), Band::Normal);
                scheduler.register(graph)
            }
        },
    )
    .expect("valid graph");

    let handle = execution.handle().clone();
    // First tick: value 7 fills the single slot, value 8 blocks. The
    // producer parks after exactly two attempts.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while *lock(&attempts) < 2 {
        assert!(std::time::Instant::now() < deadline, "producer never blocked");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    // A parked producer is not re-selected: attempts stay flat across
    // many tick intervals.
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert_eq!(*lock(&attempts), 2, "blocked producer was rescheduled");

    // Raising the capacity releases it without any consumer progress.
    handle
        .set_capacity("producer:out->sink:in", 4)
        .expect("known edge");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while *lock(&attempts) < 3 {
        assert!(std::time::Instant::now() < deadline, "producer stayed parked");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    execution.join().expect("drain times out but run returns");
}

#[test]
fn blocked_fan_out_resumes_at_the_blocking_edge() {
    let attempts = Arc::new(Mutex::new(0u64));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let metrics = InMemoryMetrics::new();

    // One output port feeding two Block edges: a live recorder and a dead
    // single-slot sink. Value 1 lands on both; value 2 lands on the
    // recorder, then blocks on the full dead edge. The retry must resume
    // at the dead edge and not hand the recorder a duplicate.
    let execution = meridian::execute(
        {
            let mut config = SchedulerConfig::default();
            config.tick_interval_ms = 1;
            config.shutdown_timeout_s = 0.2;
            config.node_error_policy = meridian::NodeErrorPolicy::Quiesce;
            config
        },
        {
            let attempts = Arc::clone(&attempts);
            let seen = Arc::clone(&seen);
            let metrics = metrics.clone();
            move |scheduler| {
                scheduler.set_metrics(Arc::new(metrics));
                let mut graph = Subgraph::new("fanout");
                graph.add_node(
                    "producer",
                    RetryingProducer {
                        pending: vec![1, 2],
                        attempts,
                    },
                );
                graph.add_node(
                    "fast",
                    Recorder {
                        seen,
                        stop_after: usize::MAX,
                    },
                );
                graph.add_node("slow", DeafSink);
                graph.connect_with(("producer", "out"), ("fast", "in"), 16, Some(Policy::Block), Band::Normal);
                graph.connect_with(("producer", "out"), ("slow", "in"), 1, Some(Policy::Block), Band::Normal);
                scheduler.register(graph)
            }
        },
    )
    .expect("valid graph");

    let handle = execution.handle().clone();
    // Attempt 1 delivers value 1 everywhere; attempt 2 blocks on the dead
    // edge after the recorder already took value 2.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while *lock(&attempts) < 2 || lock(&seen).len() < 2 {
        assert!(std::time::Instant::now() < deadline, "producer never blocked");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    // Releasing the dead edge lets the retry finish the fan-out.
    handle
        .set_capacity("producer:out->slow:in", 4)
        .expect("known edge");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while *lock(&attempts) < 3 {
        assert!(std::time::Instant::now() < deadline, "producer stayed parked");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    // Let any erroneous re-delivery land before checking.
    std::thread::sleep(std::time::Duration::from_millis(30));

    execution.join().expect("drain times out but run returns");

    // Each value reached the live consumer exactly once, and each edge
    // accepted each value exactly once.
    assert_eq!(&*lock(&seen), &[1, 2]);
    let fast: &[(&'static str, &str)] = &[("edge_id", "producer:out->fast:in")];
    let slow: &[(&'static str, &str)] = &[("edge_id", "producer:out->slow:in")];
    assert_eq!(metrics.counter_value(names::EDGE_ENQUEUED_TOTAL, fast), 2);
    assert_eq!(metrics.counter_value(names::EDGE_ENQUEUED_TOTAL, slow), 2);
}
