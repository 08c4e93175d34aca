//! End-to-end flows through small graphs: ordered delivery, saturation
//! under each overflow policy, and control preemption under sustained data
//! load.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meridian::metrics::names;
use meridian::{
    execute, Band, HookResult, InMemoryMetrics, Message, Node, NodeContext, Policy, PortSpec,
    Scheduler, SchedulerConfig, Subgraph,
};

fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.tick_interval_ms = 1;
    config
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test mutex")
}

/// Emits a fixed sequence, one value per tick.
struct Metronome {
    values: Vec<i64>,
    next: usize,
}

impl Node for Metronome {
    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("out")]
    }
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        if let Some(&value) = self.values.get(self.next) {
            self.next += 1;
            ctx.emit("out", Message::data(value))?;
        }
        Ok(())
    }
}

/// Emits its whole sequence within a single tick, as fast as possible.
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

/// Records payloads and requests shutdown after a target count.
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

#[test]
fn hello_flow_delivers_in_order_and_drains() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let metrics = InMemoryMetrics::new();

    let mut graph = Subgraph::new("hello");
    graph.add_node(
        "a",
        Metronome {
            values: vec![1, 2, 3, 4, 5],
            next: 0,
        },
    );
    graph.add_node(
        "b",
        Recorder {
            seen: Arc::clone(&seen),
            stop_after: 5,
        },
    );
    let edge = graph.connect_with(("a", "out"), ("b", "in"), 16, Some(Policy::Block), Band::Normal);
    assert_eq!(edge, "a:out->b:in");

    let mut scheduler = Scheduler::new(fast_config()).expect("valid config");
    scheduler.set_metrics(Arc::new(metrics.clone()));
    scheduler.register(graph).expect("valid graph");
    scheduler.run().expect("clean stop");

    assert_eq!(&*lock(&seen), &[1, 2, 3, 4, 5]);
    // Everything enqueued was dequeued: the edge drained to depth zero.
    let labels: &[(&'static str, &str)] = &[("edge_id", "a:out->b:in")];
    assert_eq!(metrics.counter_value(names::EDGE_ENQUEUED_TOTAL, labels), 5);
    assert_eq!(metrics.counter_value(names::EDGE_DEQUEUED_TOTAL, labels), 5);
    assert_eq!(metrics.counter_value(names::EDGE_DROPPED_TOTAL, labels), 0);
    assert_eq!(metrics.gauge_value(names::EDGE_QUEUE_DEPTH, labels), Some(0.0));
}

#[test]
fn drop_policy_under_saturation_conserves_messages() {
    let metrics = InMemoryMetrics::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let execution = execute(fast_config(), {
        let metrics = metrics.clone();
        let seen = Arc::clone(&seen);
        move |scheduler| {
            scheduler.set_metrics(Arc::new(metrics));
            let mut graph = Subgraph::new("saturate");
            graph.add_node(
                "a",
                Burst {
                    values: (0..1000).collect(),
                    fired: false,
                },
            );
            graph.add_node(
                "b",
                Recorder {
                    seen,
                    stop_after: usize::MAX,
                },
            );
            graph.connect_with(("a", "out"), ("b", "in"), 8, Some(Policy::Drop), Band::Normal);
            scheduler.register(graph)
        }
    })
    .expect("valid graph");

    let labels: &[(&'static str, &str)] = &[("edge_id", "a:out->b:in")];
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let delivered = lock(&seen).len() as u64;
        let dropped = metrics.counter_value(names::EDGE_DROPPED_TOTAL, labels);
        if delivered + dropped == 1000 && dropped > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "saturation flow never settled");
        std::thread::sleep(Duration::from_millis(5));
    }
    execution.join().expect("clean stop");

    let delivered = lock(&seen).len() as u64;
    let dropped = metrics.counter_value(names::EDGE_DROPPED_TOTAL, labels);
    assert_eq!(delivered + dropped, 1000);
    assert!(dropped > 0, "a capacity-8 edge must shed most of a 1000 burst");
}

#[test]
fn latest_policy_keeps_only_the_newest() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Subgraph::new("burst");
    graph.add_node(
        "a",
        Burst {
            values: (0..100).collect(),
            fired: false,
        },
    );
    graph.add_node(
        "b",
        Recorder {
            seen: Arc::clone(&seen),
            stop_after: 1,
        },
    );
    graph.connect_with(("a", "out"), ("b", "in"), 1, Some(Policy::Latest), Band::Normal);

    let mut scheduler = Scheduler::new(fast_config()).expect("valid config");
    scheduler.register(graph).expect("valid graph");
    scheduler.run().expect("clean stop");

    // The producer never blocks; the consumer sees exactly one message,
    // the last value of the burst.
    assert_eq!(&*lock(&seen), &[99]);
}

#[test]
fn coalesce_policy_folds_the_burst() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Subgraph::new("fold");
    graph.add_node(
        "a",
        Burst {
            values: (1..=10).collect(),
            fired: false,
        },
    );
    graph.add_node(
        "b",
        Recorder {
            seen: Arc::clone(&seen),
            stop_after: 1,
        },
    );
    let sum = Policy::coalesce(|old, new| {
        let a = *old.downcast_ref::<i64>().ok_or("expected i64")?;
        let b = *new.downcast_ref::<i64>().ok_or("expected i64")?;
        Ok(Arc::new(a + b))
    });
    graph.connect_with(("a", "out"), ("b", "in"), 1, Some(sum), Band::Normal);

    let mut scheduler = Scheduler::new(fast_config()).expect("valid config");
    scheduler.register(graph).expect("valid graph");
    scheduler.run().expect("clean stop");

    // 1 + 2 + ... + 10, folded in arrival order.
    assert_eq!(&*lock(&seen), &[55]);
}

/// Fills its output edge to the brim on every tick.
struct Flooder;

impl Node for Flooder {
    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("out")]
    }
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        loop {
            match ctx.emit("out", Message::data(0i64))? {
                meridian::PutResult::Blocked => break,
                _ => continue,
            }
        }
        Ok(())
    }
}

/// Emits a single control message on its first tick.
struct OneShotController {
    fired: bool,
}

impl Node for OneShotController {
    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("out")]
    }
    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) -> HookResult {
        if !self.fired {
            self.fired = true;
            ctx.emit("out", Message::control("pause"))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct PreemptionLog {
    control_seen: bool,
    data_before_control: u64,
    data_after_control: u64,
}

/// A worker with a data input and a control input.
struct Worker {
    log: Arc<Mutex<PreemptionLog>>,
}

impl Node for Worker {
    fn inputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::typed::<i64>("in"), PortSpec::new("ctl")]
    }
    fn on_message(&mut self, ctx: &mut NodeContext<'_>, port: &str, _msg: Message) -> HookResult {
        let mut log = lock(&self.log);
        if port == "ctl" {
            log.control_seen = true;
        } else if log.control_seen {
            log.data_after_control += 1;
            if log.data_after_control >= 10 {
                ctx.request_shutdown();
            }
        } else {
            log.data_before_control += 1;
        }
        Ok(())
    }
}

#[test]
fn control_band_preempts_sustained_data_load() {
    let log = Arc::new(Mutex::new(PreemptionLog::default()));

    let mut graph = Subgraph::new("preempt");
    graph.add_node("d", Flooder);
    graph.add_node("c", OneShotController { fired: false });
    graph.add_node("w", Worker { log: Arc::clone(&log) });
    graph.connect_with(("d", "out"), ("w", "in"), 32, Some(Policy::Block), Band::Normal);
    graph.connect_with(("c", "out"), ("w", "ctl"), 4, Some(Policy::Block), Band::Control);

    // The flooder still produces while draining, so the drain ends by
    // timeout; keep it short.
    let mut config = fast_config();
    config.shutdown_timeout_s = 0.2;
    let mut scheduler = Scheduler::new(config).expect("valid config");
    scheduler.register(graph).expect("valid graph");
    scheduler.run().expect("clean stop");

    let log = lock(&log);
    assert!(log.control_seen, "control message must be delivered under load");
    assert!(
        log.data_after_control >= 10,
        "data must keep flowing after the control message",
    );
}
