//! Overflow policies applied by edges at enqueue time.
//!
//! A policy is a pure decision: given the edge's capacity and current depth,
//! what happens to the incoming item? The edge applies the decision; the
//! policy itself never touches the buffer. All outcomes are ordinary return
//! values, never errors.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::message::Payload;

/// The outcome of a single `try_put` against an edge.
///
/// Exactly one outcome is produced per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PutResult {
    /// The item was appended; depth grew by one.
    Ok,
    /// The edge is full under the Block policy; nothing changed. The
    /// producer must yield and a consumer must run before a retry can
    /// succeed.
    Blocked,
    /// The edge is full under the Drop policy (or a merge failed); the new
    /// item was discarded and depth is unchanged.
    Dropped,
    /// The edge is full under the Latest policy; the oldest item was
    /// discarded to make room, so the retained items are a suffix of the
    /// arrival order.
    Replaced,
    /// The edge is full under a Coalesce policy; the incoming item was
    /// merged into the most recently queued one.
    Coalesced,
}

impl PutResult {
    /// True when the incoming item (or its merged aggregate) is now queued.
    pub fn is_accepted(self) -> bool {
        matches!(self, PutResult::Ok | PutResult::Replaced | PutResult::Coalesced)
    }
}

/// A merge function for [`Policy::Coalesce`], folding the queued payload
/// (first argument) with the incoming one (second argument).
///
/// The function must be pure, total, type-preserving, and cheap: no I/O and
/// no long computation, since it runs on the scheduler thread inside
/// `try_put`. A returned error converts the put into a drop and is reported
/// through the `edge.coalesce_error` instrumentation point.
pub type CoalesceFn = Arc<dyn Fn(Payload, Payload) -> Result<Payload, NodeError> + Send + Sync>;

/// Overflow strategy of an edge.
#[derive(Clone)]
pub enum Policy {
    /// Reject the item and signal backpressure when full.
    Block,
    /// Discard the incoming item when full.
    Drop,
    /// Discard the oldest queued item when full, keeping the newest.
    Latest,
    /// Merge the incoming item into the newest queued item when full.
    Coalesce(CoalesceFn),
}

impl Policy {
    /// Builds a coalescing policy from a merge function.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use meridian::Policy;
    ///
    /// let sum = Policy::coalesce(|old, new| {
    ///     let a = *old.downcast_ref::<i64>().ok_or("expected i64")?;
    ///     let b = *new.downcast_ref::<i64>().ok_or("expected i64")?;
    ///     Ok(Arc::new(a + b))
    /// });
    /// assert_eq!(sum.name(), "coalesce");
    /// ```
    pub fn coalesce<F>(merge: F) -> Self
    where
        F: Fn(Payload, Payload) -> Result<Payload, NodeError> + Send + Sync + 'static,
    {
        Policy::Coalesce(Arc::new(merge))
    }

    /// Decides the fate of an incoming item given the edge's capacity and
    /// current depth. Never inspects or modifies the buffer.
    pub fn on_enqueue(&self, capacity: usize, len: usize) -> PutResult {
        if len < capacity {
            return PutResult::Ok;
        }
        match self {
            Policy::Block => PutResult::Blocked,
            Policy::Drop => PutResult::Dropped,
            Policy::Latest => PutResult::Replaced,
            Policy::Coalesce(_) => PutResult::Coalesced,
        }
    }

    /// Stable lowercase name, used in events and introspection.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Block => "block",
            Policy::Drop => "drop",
            Policy::Latest => "latest",
            Policy::Coalesce(_) => "coalesce",
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::sync::Arc;

    fn sum() -> Policy {
        Policy::coalesce(|old, new| {
            let a = *old.downcast_ref::<i64>().ok_or("expected i64")?;
            let b = *new.downcast_ref::<i64>().ok_or("expected i64")?;
            Ok(Arc::new(a + b))
        })
    }

    #[test]
    fn below_capacity_everything_accepts() {
        for policy in [Policy::Block, Policy::Drop, Policy::Latest, sum()] {
            assert_eq!(policy.on_enqueue(4, 3), PutResult::Ok);
            assert_eq!(policy.on_enqueue(1, 0), PutResult::Ok);
        }
    }

    #[test]
    fn at_capacity_decisions() {
        assert_eq!(Policy::Block.on_enqueue(4, 4), PutResult::Blocked);
        assert_eq!(Policy::Drop.on_enqueue(4, 4), PutResult::Dropped);
        assert_eq!(Policy::Latest.on_enqueue(4, 4), PutResult::Replaced);
        assert_eq!(sum().on_enqueue(4, 4), PutResult::Coalesced);
    }

    #[test]
    fn acceptance_classification() {
        assert!(PutResult::Ok.is_accepted());
        assert!(PutResult::Replaced.is_accepted());
        assert!(PutResult::Coalesced.is_accepted());
        assert!(!PutResult::Blocked.is_accepted());
        assert!(!PutResult::Dropped.is_accepted());
    }
}
