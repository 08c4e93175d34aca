//! Flattened execution plans.
//!
//! At registration a [`Subgraph`](crate::Subgraph) is validated and
//! flattened into flat, index-keyed tables: a node table, an edge table,
//! and per-node port-to-edge maps. Integer indices avoid ownership cycles
//! even when the graph itself is cyclic. The plan owns edges and boxed
//! nodes for the lifetime of a scheduler run and is mutated only through
//! the scheduler's iteration-boundary mutators.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use smallvec::SmallVec;

use crate::edge::{edge_id, Edge};
use crate::error::RuntimeError;
use crate::logging::{EdgeInfoEvent, MeridianLogger, NodeInfoEvent};
use crate::message::Message;
use crate::metrics::{EdgeMetrics, Metrics, NodeMetrics};
use crate::node::Node;
use crate::policy::Policy;
use crate::ports::PortSpec;
use crate::scheduling::Band;
use crate::subgraph::{Issue, IssueCode, Subgraph};

/// Reserved source-node name for synthetic injection edges.
pub(crate) const EXTERNAL_NODE: &str = "external";

/// Capacity of synthetic injection edges.
pub(crate) const EXTERNAL_CAPACITY: usize = 64;

/// One input port of a planned node, with its inbound edges.
pub(crate) struct InputPort {
    pub spec: PortSpec,
    pub edges: SmallVec<[usize; 2]>,
}

/// One output port of a planned node, with its outbound edges and any
/// external subscribers.
pub(crate) struct OutputPort {
    pub spec: PortSpec,
    pub edges: SmallVec<[usize; 2]>,
    pub taps: Vec<Sender<Message>>,
}

/// A node in the flattened plan.
pub(crate) struct NodeEntry {
    pub name: String,
    pub node: RefCell<Box<dyn Node>>,
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
    pub tick_interval: Option<Duration>,
    pub metrics: NodeMetrics,
}

/// Read-only description of one edge, for introspection.
#[derive(Clone, Debug)]
pub struct EdgeInfo {
    /// Stable edge id.
    pub id: String,
    /// Configured capacity.
    pub capacity: usize,
    /// Current queue depth.
    pub depth: usize,
    /// Overflow policy name.
    pub policy: String,
    /// Priority band.
    pub band: Band,
}

/// The flat tables a scheduler runs from.
#[derive(Default)]
pub(crate) struct RuntimePlan {
    pub nodes: Vec<NodeEntry>,
    pub edges: Vec<RefCell<Edge>>,
    pub node_index: HashMap<String, usize>,
    pub edge_index: HashMap<String, usize>,
    /// Exposed input name to its synthetic injection edge.
    pub external_inputs: HashMap<String, usize>,
    /// Exposed output name to `(node, output port)`.
    pub exposed_outputs: HashMap<String, (usize, usize)>,
    /// Producers-first order; nodes on cycles follow in insertion order.
    pub topo: Vec<usize>,
}

impl RuntimePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `graph` and folds it into the plan. On success, returns
    /// the warning-severity issues for the caller to report; on any
    /// error-severity issue the plan is left untouched.
    pub fn absorb(
        &mut self,
        graph: Subgraph,
        metrics: &dyn Metrics,
        logger: Option<&MeridianLogger>,
    ) -> Result<Vec<Issue>, RuntimeError> {
        let mut issues = graph.validate();
        let parts = graph.into_parts();

        for (name, _) in &parts.nodes {
            if self.node_index.contains_key(name) {
                issues.push(Issue::error(
                    IssueCode::DupNode,
                    format!("node '{name}' is already registered"),
                ));
            }
        }
        for (name, _) in &parts.exposed_inputs {
            if self.external_inputs.contains_key(name) {
                issues.push(Issue::error(
                    IssueCode::DupExposeIn,
                    format!("exposed input '{name}' is already registered"),
                ));
            }
        }
        for (name, _) in &parts.exposed_outputs {
            if self.exposed_outputs.contains_key(name) {
                issues.push(Issue::error(
                    IssueCode::DupExposeOut,
                    format!("exposed output '{name}' is already registered"),
                ));
            }
        }
        if issues.iter().any(Issue::is_error) {
            return Err(RuntimeError::Validation(issues));
        }

        // Node table.
        let base = self.nodes.len();
        for (offset, (name, node)) in parts.nodes.into_iter().enumerate() {
            let index = base + offset;
            let inputs = node
                .inputs()
                .into_iter()
                .map(|spec| InputPort {
                    spec,
                    edges: SmallVec::new(),
                })
                .collect();
            let outputs = node
                .outputs()
                .into_iter()
                .map(|spec| OutputPort {
                    spec,
                    edges: SmallVec::new(),
                    taps: Vec::new(),
                })
                .collect();
            let tick_interval = node.tick_interval();
            if let Some(logger) = logger {
                logger.log(NodeInfoEvent {
                    id: index,
                    name: name.clone(),
                });
            }
            let node_metrics = NodeMetrics::bind(metrics, &name);
            self.node_index.insert(name.clone(), index);
            self.nodes.push(NodeEntry {
                name,
                node: RefCell::new(node),
                inputs,
                outputs,
                tick_interval,
                metrics: node_metrics,
            });
        }

        // Edge table; endpoints were checked by validation.
        for spec in parts.edges {
            let (Some(&src_ix), Some(&dst_ix)) = (
                self.node_index.get(&spec.src.node),
                self.node_index.get(&spec.dst.node),
            ) else {
                continue;
            };
            let (Some(src_port), Some(dst_port)) = (
                output_port_index(&self.nodes[src_ix], &spec.src.port),
                input_port_index(&self.nodes[dst_ix], &spec.dst.port),
            ) else {
                continue;
            };
            let dst_spec = &self.nodes[dst_ix].inputs[dst_port].spec;
            let policy = spec
                .policy
                .or_else(|| dst_spec.default_policy().cloned())
                .unwrap_or(Policy::Latest);
            self.push_edge(
                spec.id,
                Some(src_ix),
                Some(src_port),
                dst_ix,
                dst_port,
                spec.capacity,
                policy,
                spec.band,
                metrics,
                logger,
            );
        }

        // Synthetic injection edges for exposed inputs.
        for (name, target) in parts.exposed_inputs {
            let Some(&dst_ix) = self.node_index.get(&target.node) else {
                continue;
            };
            let Some(dst_port) = input_port_index(&self.nodes[dst_ix], &target.port) else {
                continue;
            };
            let dst_spec = &self.nodes[dst_ix].inputs[dst_port].spec;
            let policy = dst_spec.default_policy().cloned().unwrap_or(Policy::Block);
            let id = edge_id(EXTERNAL_NODE, &name, &target.node, &target.port);
            let edge_ix = self.push_edge(
                id,
                None,
                None,
                dst_ix,
                dst_port,
                EXTERNAL_CAPACITY,
                policy,
                Band::Normal,
                metrics,
                logger,
            );
            self.external_inputs.insert(name, edge_ix);
        }

        for (name, source) in parts.exposed_outputs {
            let Some(&node_ix) = self.node_index.get(&source.node) else {
                continue;
            };
            let Some(port_ix) = output_port_index(&self.nodes[node_ix], &source.port) else {
                continue;
            };
            self.exposed_outputs.insert(name, (node_ix, port_ix));
        }

        self.topo = self.toposort();
        Ok(issues)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_edge(
        &mut self,
        id: String,
        src: Option<usize>,
        src_port: Option<usize>,
        dst: usize,
        dst_port: usize,
        capacity: usize,
        policy: Policy,
        band: Band,
        metrics: &dyn Metrics,
        logger: Option<&MeridianLogger>,
    ) -> usize {
        let index = self.edges.len();
        if let Some(logger) = logger {
            logger.log(EdgeInfoEvent {
                id: index,
                edge_id: id.clone(),
                capacity,
                policy: policy.name().to_owned(),
                band,
            });
        }
        let schema = self.nodes[dst].inputs[dst_port].spec.schema().cloned();
        let edge = Edge::new(
            index,
            id.clone(),
            src,
            dst,
            capacity,
            policy,
            band,
            schema,
            EdgeMetrics::bind(metrics, &id),
            logger.cloned(),
        );
        self.edge_index.insert(id, index);
        self.edges.push(RefCell::new(edge));
        if let (Some(src), Some(src_port)) = (src, src_port) {
            self.nodes[src].outputs[src_port].edges.push(index);
        }
        self.nodes[dst].inputs[dst_port].edges.push(index);
        index
    }

    /// Attaches an external subscriber to an exposed output. Every message
    /// emitted on the underlying port is mirrored to the receiver.
    pub fn subscribe_output(&mut self, name: &str) -> Result<Receiver<Message>, RuntimeError> {
        let &(node_ix, port_ix) = self.exposed_outputs.get(name).ok_or_else(|| {
            RuntimeError::invalid(format!("no exposed output named '{name}'"))
        })?;
        let (tx, rx) = channel();
        self.nodes[node_ix].outputs[port_ix].taps.push(tx);
        Ok(rx)
    }

    /// Read-only description of every edge, in table order.
    pub fn edge_infos(&self) -> Vec<EdgeInfo> {
        self.edges
            .iter()
            .map(|cell| {
                let edge = cell.borrow();
                EdgeInfo {
                    id: edge.id().to_owned(),
                    capacity: edge.capacity(),
                    depth: edge.depth(),
                    policy: edge.policy().name().to_owned(),
                    band: edge.band(),
                }
            })
            .collect()
    }

    /// True when every edge is empty.
    pub fn all_edges_empty(&self) -> bool {
        self.edges.iter().all(|cell| cell.borrow().is_empty())
    }

    /// Producers-first ordering via Kahn's algorithm, ties broken by the
    /// smallest node index. Nodes on cycles have no such ordering; they are
    /// appended in insertion order and the cycle was already flagged by
    /// validation.
    fn toposort(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut adjacency = vec![Vec::new(); n];
        for cell in &self.edges {
            let edge = cell.borrow();
            if let Some(src) = edge.src() {
                adjacency[src].push(edge.dst());
                indegree[edge.dst()] += 1;
            }
        }

        let mut heap: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(Reverse)
            .collect();
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = heap.pop() {
            placed[node] = true;
            order.push(node);
            for &next in &adjacency[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 && !placed[next] {
                    heap.push(Reverse(next));
                }
            }
        }
        for (node, placed) in placed.into_iter().enumerate() {
            if !placed {
                order.push(node);
            }
        }
        order
    }
}

fn input_port_index(entry: &NodeEntry, port: &str) -> Option<usize> {
    entry.inputs.iter().position(|p| p.spec.name() == port)
}

fn output_port_index(entry: &NodeEntry, port: &str) -> Option<usize> {
    entry.outputs.iter().position(|p| p.spec.name() == port)
}
