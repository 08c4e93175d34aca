//! Priority bands and the fair ready queue.
//!
//! The scheduler keeps runnable nodes in three banded FIFO queues and picks
//! among bands by weighted service tokens. A small array of deques plus a
//! token counter beats a general priority heap here: ordering within a band
//! must be FIFO and insertion must deduplicate.

pub(crate) mod waker;

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A priority class for edges and ready nodes.
///
/// Bands are ordered `Control > High > Normal`; the derived `Ord` ranks
/// higher-priority bands as smaller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Band {
    /// Control-plane traffic: preferred within the fairness ratio.
    Control,
    /// Latency-sensitive data.
    High,
    /// Everything else, including tick-only readiness.
    Normal,
}

impl Band {
    /// All bands, highest priority first.
    pub const ALL: [Band; 3] = [Band::Control, Band::High, Band::Normal];

    /// Index into band-ordered arrays, highest priority first.
    pub fn index(self) -> usize {
        match self {
            Band::Control => 0,
            Band::High => 1,
            Band::Normal => 2,
        }
    }

    /// Stable lowercase name, used as a metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Band::Control => "control",
            Band::High => "high",
            Band::Normal => "normal",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler-side state of one node.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeState {
    /// A tick interval has elapsed and has not been serviced yet. At most
    /// one tick is ever pending.
    pub tick_ready: bool,
    /// When the next tick becomes due.
    pub next_tick: Option<Instant>,
    /// The edge whose Block decision parked this node, if any. A blocked
    /// node is not re-selected until the edge drains or grows.
    pub blocked_on: Option<usize>,
    /// Where a blocked fan-out emit left off: `(output port, edge offset)`.
    /// The next emit on that port resumes from the offset, so edges that
    /// already accepted the message are not delivered to twice.
    pub resume_emit: Option<(usize, usize)>,
    /// When the current blocked interval began.
    pub blocked_since: Option<Instant>,
    /// The node was removed from scheduling by the error policy.
    pub quiesced: bool,
}

impl NodeState {
    pub fn is_blocked(&self) -> bool {
        self.blocked_on.is_some()
    }
}

/// Banded ready queues with weighted round-robin selection.
///
/// A node appears at most once across all bands. Enqueueing an already
/// queued node at a higher band promotes it: the entry in the lower band
/// goes stale and is skipped when popped.
pub(crate) struct ReadyQueue {
    bands: [VecDeque<usize>; 3],
    membership: Vec<Option<Band>>,
    live: [usize; 3],
    tokens: [u32; 3],
    ratio: [u32; 3],
}

impl ReadyQueue {
    pub fn new(ratio: (u32, u32, u32)) -> Self {
        let ratio = [ratio.0, ratio.1, ratio.2];
        ReadyQueue {
            bands: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            membership: Vec::new(),
            live: [0; 3],
            tokens: ratio,
            ratio,
        }
    }

    /// Makes room for `nodes` node indices.
    pub fn resize(&mut self, nodes: usize) {
        if self.membership.len() < nodes {
            self.membership.resize(nodes, None);
        }
    }

    /// Enqueues `node` at `band`. Returns false when the node was already
    /// queued at this band or a higher one.
    pub fn push(&mut self, node: usize, band: Band) -> bool {
        if node >= self.membership.len() {
            self.membership.resize(node + 1, None);
        }
        match self.membership[node] {
            None => {
                self.membership[node] = Some(band);
                self.bands[band.index()].push_back(node);
                self.live[band.index()] += 1;
                true
            }
            Some(current) if band.index() < current.index() => {
                // Promote; the entry in `current` goes stale.
                self.membership[node] = Some(band);
                self.bands[band.index()].push_back(node);
                self.live[current.index()] -= 1;
                self.live[band.index()] += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Selects the next node to service.
    ///
    /// Preference goes to the highest band that still has service tokens
    /// and content; tokens refill when no such band exists. If every band
    /// with content is out of ratio (a zero weight), the highest non-empty
    /// band is served anyway so nothing starves.
    pub fn pop(&mut self) -> Option<(usize, Band)> {
        if self.len() == 0 {
            return None;
        }
        loop {
            let band = match self.eligible_band() {
                Some(band) => band,
                None => {
                    self.tokens = self.ratio;
                    match self.eligible_band() {
                        Some(band) => band,
                        None => self.fallback_band()?,
                    }
                }
            };
            if let Some(node) = self.pop_valid(band) {
                self.tokens[band.index()] = self.tokens[band.index()].saturating_sub(1);
                return Some((node, band));
            }
        }
    }

    /// True when no node is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued nodes across all bands.
    pub fn len(&self) -> usize {
        self.live.iter().sum()
    }

    /// Number of queued nodes in one band.
    pub fn len_in(&self, band: Band) -> usize {
        self.live[band.index()]
    }

    fn eligible_band(&self) -> Option<Band> {
        Band::ALL
            .into_iter()
            .find(|b| self.tokens[b.index()] > 0 && self.live[b.index()] > 0)
    }

    fn fallback_band(&self) -> Option<Band> {
        Band::ALL.into_iter().find(|b| self.live[b.index()] > 0)
    }

    fn pop_valid(&mut self, band: Band) -> Option<usize> {
        while let Some(node) = self.bands[band.index()].pop_front() {
            if self.membership[node] == Some(band) {
                self.membership[node] = None;
                self.live[band.index()] -= 1;
                return Some(node);
            }
            // Stale entry left behind by a promotion; skip it.
        }
        None
    }
}
