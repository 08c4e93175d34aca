//! Bounded, policy-governed FIFO edges.
//!
//! An edge connects one output port to one input port, holds at most
//! `capacity` messages, and applies its overflow [`Policy`] on enqueue.
//! `try_put` never blocks: a full Block edge answers
//! [`PutResult::Blocked`] and leaves the scheduler to park the producer.
//! Every decision is instrumented exactly once.

use std::collections::VecDeque;

use crate::error::RuntimeError;
use crate::logging::{
    EdgeCoalesceErrorEvent, EdgeCoalesceEvent, EdgeDequeueEvent, EdgeDropEvent, EdgeEnqueueEvent,
    EdgeReplaceEvent, EdgeValidationFailedEvent, MeridianEvent, MeridianLogger,
};
use crate::message::Message;
use crate::metrics::EdgeMetrics;
use crate::policy::{Policy, PutResult};
use crate::ports::Schema;
use crate::scheduling::Band;

/// Formats the stable edge id for a `(src, src_port) -> (dst, dst_port)`
/// connection. This format is part of the public contract: it labels edge
/// metrics and names edges for the runtime mutators.
pub fn edge_id(src_node: &str, src_port: &str, dst_node: &str, dst_port: &str) -> String {
    format!("{src_node}:{src_port}->{dst_node}:{dst_port}")
}

/// A bounded FIFO between two ports.
pub struct Edge {
    index: usize,
    id: String,
    src: Option<usize>,
    dst: usize,
    capacity: usize,
    policy: Policy,
    band: Band,
    schema: Option<Schema>,
    buffer: VecDeque<Message>,
    enqueued_total: u64,
    dequeued_total: u64,
    dropped_total: u64,
    metrics: EdgeMetrics,
    logger: Option<MeridianLogger>,
}

impl Edge {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        id: String,
        src: Option<usize>,
        dst: usize,
        capacity: usize,
        policy: Policy,
        band: Band,
        schema: Option<Schema>,
        metrics: EdgeMetrics,
        logger: Option<MeridianLogger>,
    ) -> Self {
        Edge {
            index,
            id,
            src,
            dst,
            capacity,
            policy,
            band,
            schema,
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            enqueued_total: 0,
            dequeued_total: 0,
            dropped_total: 0,
            metrics,
            logger,
        }
    }

    /// Offers a message to the edge, applying the effective policy:
    /// the override argument if given, otherwise the edge's own policy.
    ///
    /// Exactly one [`PutResult`] is produced per call, and the call never
    /// blocks. A schema mismatch is a programmer error, not flow control:
    /// it raises [`RuntimeError::TypeMismatch`] into the producer and leaves
    /// the buffer untouched.
    pub fn try_put(
        &mut self,
        msg: Message,
        policy_override: Option<&Policy>,
    ) -> Result<PutResult, RuntimeError> {
        if let Some(schema) = &self.schema {
            if !schema.admits(msg.payload()) {
                self.log(EdgeValidationFailedEvent {
                    id: self.index,
                    expected: schema.label().to_owned(),
                    found: msg.payload_type().to_owned(),
                });
                return Err(RuntimeError::TypeMismatch {
                    edge: self.id.clone(),
                    expected: schema.label().to_owned(),
                    found: msg.payload_type().to_owned(),
                });
            }
        }

        let effective = policy_override.cloned().unwrap_or_else(|| self.policy.clone());
        let mut decision = effective.on_enqueue(self.capacity, self.buffer.len());
        match decision {
            PutResult::Ok => {
                self.buffer.push_back(msg);
                self.enqueued_total += 1;
                self.metrics.enqueued.inc();
                self.log(EdgeEnqueueEvent { id: self.index });
            }
            PutResult::Blocked => {
                // Nothing changes; the scheduler parks the producer until
                // depth decreases or capacity grows.
            }
            PutResult::Dropped => {
                self.dropped_total += 1;
                self.metrics.dropped.inc();
                self.log(EdgeDropEvent { id: self.index });
            }
            PutResult::Replaced => {
                self.buffer.pop_front();
                self.buffer.push_back(msg);
                self.enqueued_total += 1;
                self.dropped_total += 1;
                self.metrics.enqueued.inc();
                self.metrics.dropped.inc();
                self.log(EdgeReplaceEvent { id: self.index });
            }
            PutResult::Coalesced => {
                if let Policy::Coalesce(merge) = &effective {
                    if let Some(old) = self.buffer.pop_back() {
                        match merge(old.payload_arc(), msg.payload_arc()) {
                            Ok(folded) => {
                                self.buffer.push_back(msg.with_payload(folded));
                                self.enqueued_total += 1;
                                self.metrics.enqueued.inc();
                                self.log(EdgeCoalesceEvent { id: self.index });
                            }
                            Err(error) => {
                                // Merge failure converts the put into a drop;
                                // the queued item is restored untouched.
                                self.buffer.push_back(old);
                                self.dropped_total += 1;
                                self.metrics.dropped.inc();
                                self.log(EdgeCoalesceErrorEvent {
                                    id: self.index,
                                    error: error.to_string(),
                                });
                                decision = PutResult::Dropped;
                            }
                        }
                    } else {
                        // Capacity is validated positive, so a full buffer
                        // has a tail; tolerate anyway.
                        self.buffer.push_back(msg);
                        self.enqueued_total += 1;
                        self.metrics.enqueued.inc();
                        self.log(EdgeEnqueueEvent { id: self.index });
                        decision = PutResult::Ok;
                    }
                }
            }
        }
        self.metrics.depth.set(self.buffer.len() as f64);
        Ok(decision)
    }

    /// Removes and returns the head message, if any.
    pub fn try_get(&mut self) -> Option<Message> {
        let msg = self.buffer.pop_front()?;
        self.dequeued_total += 1;
        self.metrics.dequeued.inc();
        self.metrics.depth.set(self.buffer.len() as f64);
        self.log(EdgeDequeueEvent { id: self.index });
        Some(msg)
    }

    /// Number of retained messages, always within `0..=capacity`.
    pub fn depth(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when the next Block put would be refused.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// The stable edge id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The edge's own overflow policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The edge's priority band.
    pub fn band(&self) -> Band {
        self.band
    }

    /// Items accepted over the edge's lifetime.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total
    }

    /// Items handed to the consumer over the edge's lifetime.
    pub fn dequeued_total(&self) -> u64 {
        self.dequeued_total
    }

    /// Items discarded over the edge's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub(crate) fn src(&self) -> Option<usize> {
        self.src
    }

    pub(crate) fn dst(&self) -> usize {
        self.dst
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub(crate) fn set_band(&mut self, band: Band) {
        self.band = band;
    }

    pub(crate) fn blocked_time(&self) -> &crate::metrics::Histogram {
        &self.metrics.blocked_time
    }

    /// Discards everything still queued, counting the discards. Used when
    /// draining times out.
    pub(crate) fn discard_remaining(&mut self) -> u64 {
        let count = self.buffer.len() as u64;
        if count > 0 {
            self.dropped_total += count;
            self.metrics.dropped.add(count);
            self.buffer.clear();
            self.metrics.depth.set(0.0);
        }
        count
    }

    fn log<E: Into<MeridianEvent>>(&self, event: E) {
        if let Some(logger) = &self.logger {
            logger.log(event);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::message::Message;
    use crate::policy::Policy;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn edge(capacity: usize, policy: Policy) -> Edge {
        Edge::new(
            0,
            edge_id("a", "out", "b", "in"),
            Some(0),
            1,
            capacity,
            policy,
            Band::Normal,
            None,
            EdgeMetrics::default(),
            None,
        )
    }

    fn sum_policy() -> Policy {
        Policy::coalesce(|old, new| {
            let a = *old.downcast_ref::<i64>().ok_or("expected i64")?;
            let b = *new.downcast_ref::<i64>().ok_or("expected i64")?;
            Ok(Arc::new(a + b))
        })
    }

    fn put(edge: &mut Edge, value: i64) -> PutResult {
        edge.try_put(Message::data(value), None).expect("no schema on edge")
    }

    #[test]
    fn id_format_is_stable() {
        assert_eq!(edge_id("a", "out", "b", "in"), "a:out->b:in");
    }

    #[test]
    fn block_refuses_without_modification() {
        let mut e = edge(1, Policy::Block);
        assert_eq!(put(&mut e, 1), PutResult::Ok);
        assert_eq!(put(&mut e, 2), PutResult::Blocked);
        assert_eq!(e.depth(), 1);
        assert_eq!(e.try_get().unwrap().downcast_ref::<i64>(), Some(&1));
        assert_eq!(put(&mut e, 2), PutResult::Ok);
    }

    #[test]
    fn drop_discards_newest() {
        let mut e = edge(2, Policy::Drop);
        put(&mut e, 1);
        put(&mut e, 2);
        assert_eq!(put(&mut e, 3), PutResult::Dropped);
        assert_eq!(e.depth(), 2);
        assert_eq!(e.dropped_total(), 1);
        assert_eq!(e.try_get().unwrap().downcast_ref::<i64>(), Some(&1));
    }

    #[test]
    fn latest_retains_suffix_of_arrivals() {
        let mut e = edge(3, Policy::Latest);
        for v in 0..10 {
            let result = put(&mut e, v);
            assert!(matches!(result, PutResult::Ok | PutResult::Replaced));
        }
        let retained: Vec<i64> = std::iter::from_fn(|| e.try_get())
            .map(|m| *m.downcast_ref::<i64>().unwrap())
            .collect();
        assert_eq!(retained, vec![7, 8, 9]);
    }

    #[test]
    fn latest_capacity_one_never_blocks() {
        let mut e = edge(1, Policy::Latest);
        assert_eq!(put(&mut e, 0), PutResult::Ok);
        for v in 1..100 {
            assert_eq!(put(&mut e, v), PutResult::Replaced);
            assert_eq!(e.depth(), 1);
        }
        assert_eq!(e.try_get().unwrap().downcast_ref::<i64>(), Some(&99));
        assert!(e.is_empty());
    }

    #[test]
    fn coalesce_folds_in_arrival_order() {
        let mut e = edge(1, sum_policy());
        for v in 1..=10 {
            put(&mut e, v);
        }
        assert_eq!(e.depth(), 1);
        assert_eq!(e.try_get().unwrap().downcast_ref::<i64>(), Some(&55));
    }

    #[test]
    fn coalesce_error_drops_and_preserves_queue() {
        let failing = Policy::coalesce(|_, _| Err("merge exploded".into()));
        let mut e = edge(1, failing);
        assert_eq!(put(&mut e, 1), PutResult::Ok);
        assert_eq!(put(&mut e, 2), PutResult::Dropped);
        assert_eq!(e.depth(), 1);
        assert_eq!(e.dropped_total(), 1);
        // The previously queued item is intact.
        assert_eq!(e.try_get().unwrap().downcast_ref::<i64>(), Some(&1));
    }

    #[test]
    fn schema_mismatch_is_an_error_not_flow_control() {
        let mut e = Edge::new(
            0,
            edge_id("a", "out", "b", "in"),
            Some(0),
            1,
            4,
            Policy::Block,
            Band::Normal,
            Some(crate::ports::Schema::of::<i64>()),
            EdgeMetrics::default(),
            None,
        );
        assert!(e.try_put(Message::data(1i64), None).is_ok());
        let err = e.try_put(Message::data("oops"), None).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
        assert_eq!(e.depth(), 1);
    }

    #[test]
    fn override_policy_wins_over_edge_default() {
        let mut e = edge(1, Policy::Block);
        put(&mut e, 1);
        let result = e.try_put(Message::data(2i64), Some(&Policy::Drop)).unwrap();
        assert_eq!(result, PutResult::Dropped);
    }

    #[test]
    fn discard_remaining_counts() {
        let mut e = edge(8, Policy::Block);
        for v in 0..5 {
            put(&mut e, v);
        }
        assert_eq!(e.discard_remaining(), 5);
        assert!(e.is_empty());
        assert_eq!(e.dropped_total(), 5);
    }

    proptest! {
        // Depth stays within bounds for every policy under arbitrary
        // put/get interleavings, and every put yields exactly one result.
        #[test]
        fn depth_bounded_by_capacity(
            ops in proptest::collection::vec(any::<bool>(), 1..200),
            capacity in 1usize..8,
            which in 0usize..4,
        ) {
            let policy = match which {
                0 => Policy::Block,
                1 => Policy::Drop,
                2 => Policy::Latest,
                _ => sum_policy(),
            };
            let mut e = edge(capacity, policy);
            let mut value = 0i64;
            for is_put in ops {
                if is_put {
                    value += 1;
                    let _ = put(&mut e, value);
                } else {
                    let _ = e.try_get();
                }
                prop_assert!(e.depth() <= capacity);
            }
        }

        // Conservation: everything accepted is either still queued,
        // dequeued, or (for Latest) accounted as dropped.
        #[test]
        fn counters_conserve_messages(puts in 1usize..100, capacity in 1usize..8) {
            let mut e = edge(capacity, Policy::Latest);
            for v in 0..puts as i64 {
                let _ = put(&mut e, v);
            }
            while e.try_get().is_some() {}
            prop_assert_eq!(e.enqueued_total(), puts as u64);
            prop_assert_eq!(e.dequeued_total() + e.dropped_total(), puts as u64);
        }
    }
}
