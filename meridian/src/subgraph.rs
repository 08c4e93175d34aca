//! Graph composition and structural validation.
//!
//! A [`Subgraph`] is a builder: it records nodes, connections, and exposed
//! ports without failing. Problems surface later, all at once, through
//! [`Subgraph::validate`], which returns machine-readable [`Issue`]s. Any
//! error-severity issue prevents the scheduler from running the graph;
//! warnings (such as cycles) do not.

use std::collections::{HashMap, HashSet};
use std::fmt;

use itertools::Itertools;
use serde::Serialize;

use crate::edge::edge_id;
use crate::node::Node;
use crate::policy::Policy;
use crate::ports::PortSpec;
use crate::scheduling::Band;

/// A named `(node, port)` endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    /// Node name within the graph.
    pub node: String,
    /// Port name on that node.
    pub port: String,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Endpoint {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl<N: Into<String>, P: Into<String>> From<(N, P)> for Endpoint {
    fn from((node, port): (N, P)) -> Self {
        Endpoint::new(node, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// Severity of a validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Severity {
    /// The graph may still run.
    Warning,
    /// The scheduler refuses to run the graph.
    Error,
}

/// Machine-readable class of a validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum IssueCode {
    /// Two nodes share a name.
    DupNode,
    /// An edge endpoint references a missing node.
    UnknownNode,
    /// The source node has no such output port.
    NoSrcPort,
    /// The destination node has no such input port.
    NoDstPort,
    /// A node declares the same port name twice on one side.
    DupPort,
    /// Edge capacity is zero.
    BadCap,
    /// Two edges share the same id.
    DupEdge,
    /// Source output schema is incompatible with the destination input
    /// schema.
    TypeMismatch,
    /// Two exposed inputs share a name.
    DupExposeIn,
    /// Two exposed outputs share a name.
    DupExposeOut,
    /// An exposed input maps to an invalid target.
    BadExposeIn,
    /// An exposed output maps to an invalid source.
    BadExposeOut,
    /// The graph contains a cycle. Permitted, but cycles whose edges all
    /// block can deadlock unless capacities admit one in-flight message
    /// per cycle edge.
    CycleWarn,
}

impl IssueCode {
    /// Stable SCREAMING_SNAKE_CASE code string.
    pub fn as_str(self) -> &'static str {
        match self {
            IssueCode::DupNode => "DUP_NODE",
            IssueCode::UnknownNode => "UNKNOWN_NODE",
            IssueCode::NoSrcPort => "NO_SRC_PORT",
            IssueCode::NoDstPort => "NO_DST_PORT",
            IssueCode::DupPort => "DUP_PORT",
            IssueCode::BadCap => "BAD_CAP",
            IssueCode::DupEdge => "DUP_EDGE",
            IssueCode::TypeMismatch => "TYPE_MISMATCH",
            IssueCode::DupExposeIn => "DUP_EXPOSE_IN",
            IssueCode::DupExposeOut => "DUP_EXPOSE_OUT",
            IssueCode::BadExposeIn => "BAD_EXPOSE_IN",
            IssueCode::BadExposeOut => "BAD_EXPOSE_OUT",
            IssueCode::CycleWarn => "CYCLE_WARN",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found while validating a graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// How bad it is.
    pub severity: Severity,
    /// What class of problem it is.
    pub code: IssueCode,
    /// Human-readable detail naming the offending element.
    pub message: String,
}

impl Issue {
    pub(crate) fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Issue {
            severity: Severity::Error,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Issue {
            severity: Severity::Warning,
            code,
            message: message.into(),
        }
    }

    /// True for error-severity issues.
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// A recorded connection, before flattening into a runtime edge.
#[derive(Clone)]
pub(crate) struct EdgeSpec {
    pub id: String,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub capacity: usize,
    pub policy: Option<Policy>,
    pub band: Band,
}

/// The pieces a subgraph decomposes into at registration.
pub(crate) struct SubgraphParts {
    pub nodes: Vec<(String, Box<dyn Node>)>,
    pub edges: Vec<EdgeSpec>,
    pub exposed_inputs: Vec<(String, Endpoint)>,
    pub exposed_outputs: Vec<(String, Endpoint)>,
}

/// A composable collection of nodes and edges with exposed external ports.
///
/// Builder methods never fail; call [`Subgraph::validate`] (or let
/// registration do it) to learn about problems.
///
/// # Examples
///
/// ```
/// use meridian::{Node, PortSpec, Subgraph};
///
/// struct Source;
/// impl Node for Source {
///     fn outputs(&self) -> Vec<PortSpec> {
///         vec![PortSpec::typed::<u64>("out")]
///     }
/// }
///
/// struct Sink;
/// impl Node for Sink {
///     fn inputs(&self) -> Vec<PortSpec> {
///         vec![PortSpec::typed::<u64>("in")]
///     }
/// }
///
/// let mut graph = Subgraph::new("pipeline");
/// graph.add_node("source", Source);
/// graph.add_node("sink", Sink);
/// let edge = graph.connect(("source", "out"), ("sink", "in"), 16);
/// assert_eq!(edge, "source:out->sink:in");
/// assert!(graph.validate().is_empty());
/// ```
pub struct Subgraph {
    name: String,
    nodes: Vec<(String, Box<dyn Node>)>,
    edges: Vec<EdgeSpec>,
    exposed_inputs: Vec<(String, Endpoint)>,
    exposed_outputs: Vec<(String, Endpoint)>,
    aliases_in: HashMap<(String, String), Endpoint>,
    aliases_out: HashMap<(String, String), Endpoint>,
    child_names: HashSet<String>,
    deferred: Vec<Issue>,
}

impl Subgraph {
    /// Creates an empty subgraph.
    pub fn new(name: impl Into<String>) -> Self {
        Subgraph {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            exposed_inputs: Vec::new(),
            exposed_outputs: Vec::new(),
            aliases_in: HashMap::new(),
            aliases_out: HashMap::new(),
            child_names: HashSet::new(),
            deferred: Vec::new(),
        }
    }

    /// The subgraph's name, used as the namespace prefix when it is added
    /// to a parent.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a node under a unique name. A duplicate name is recorded
    /// and reported by [`Subgraph::validate`] as `DUP_NODE`.
    pub fn add_node(&mut self, name: impl Into<String>, node: impl Node + 'static) -> &mut Self {
        self.nodes.push((name.into(), Box::new(node)));
        self
    }

    /// Connects an output port to an input port through a bounded edge with
    /// the default policy resolution (destination port default, else
    /// Latest) and the Normal band. Returns the deterministic edge id.
    pub fn connect(
        &mut self,
        src: impl Into<Endpoint>,
        dst: impl Into<Endpoint>,
        capacity: usize,
    ) -> String {
        self.connect_with(src, dst, capacity, None, Band::Normal)
    }

    /// Connects with an explicit overflow policy and priority band.
    ///
    /// Endpoints naming a nested subgraph's exposed port are resolved to
    /// the underlying node port. Capacity must be positive; zero is
    /// recorded and reported as `BAD_CAP`.
    pub fn connect_with(
        &mut self,
        src: impl Into<Endpoint>,
        dst: impl Into<Endpoint>,
        capacity: usize,
        policy: Option<Policy>,
        band: Band,
    ) -> String {
        let src = self.resolve_out(src.into());
        let dst = self.resolve_in(dst.into());
        let id = edge_id(&src.node, &src.port, &dst.node, &dst.port);
        self.edges.push(EdgeSpec {
            id: id.clone(),
            src,
            dst,
            capacity,
            policy,
            band,
        });
        id
    }

    /// Exposes an internal input port under an external name. Externally
    /// injected messages for `name` arrive on `target`.
    pub fn expose_input(&mut self, name: impl Into<String>, target: impl Into<Endpoint>) -> &mut Self {
        let target = self.resolve_in(target.into());
        self.exposed_inputs.push((name.into(), target));
        self
    }

    /// Exposes an internal output port under an external name. External
    /// subscribers for `name` observe emissions from `source`.
    pub fn expose_output(&mut self, name: impl Into<String>, source: impl Into<Endpoint>) -> &mut Self {
        let source = self.resolve_out(source.into());
        self.exposed_outputs.push((name.into(), source));
        self
    }

    /// Composes a child subgraph into this one.
    ///
    /// Child nodes are namespaced as `"<child>.<node>"`; the child's
    /// exposed ports become connectable here as `(child_name, port)`
    /// endpoints. Edge ids stay deterministic under the new names.
    pub fn add_subgraph(&mut self, child: Subgraph) -> &mut Self {
        let prefix = child.name.clone();
        if self.child_names.contains(&prefix) || self.nodes.iter().any(|(n, _)| *n == prefix) {
            self.deferred.push(Issue::error(
                IssueCode::DupNode,
                format!("subgraph '{prefix}' collides with an existing name"),
            ));
        }
        self.child_names.insert(prefix.clone());

        let qualify = |ep: Endpoint| Endpoint {
            node: format!("{prefix}.{}", ep.node),
            port: ep.port,
        };

        for (name, node) in child.nodes {
            self.nodes.push((format!("{prefix}.{name}"), node));
        }
        for spec in child.edges {
            let src = qualify(spec.src);
            let dst = qualify(spec.dst);
            self.edges.push(EdgeSpec {
                id: edge_id(&src.node, &src.port, &dst.node, &dst.port),
                src,
                dst,
                capacity: spec.capacity,
                policy: spec.policy,
                band: spec.band,
            });
        }
        for (name, target) in child.exposed_inputs {
            self.aliases_in.insert((prefix.clone(), name), qualify(target));
        }
        for (name, source) in child.exposed_outputs {
            self.aliases_out.insert((prefix.clone(), name), qualify(source));
        }
        self.deferred.extend(child.deferred);
        self
    }

    /// Checks the structure and returns every issue found, errors and
    /// warnings alike, in deterministic order. Pure: repeated calls on the
    /// same graph yield the same list.
    pub fn validate(&self) -> Vec<Issue> {
        let mut issues = self.deferred.clone();

        // Duplicate node names.
        for name in self.nodes.iter().map(|(n, _)| n).duplicates() {
            issues.push(Issue::error(
                IssueCode::DupNode,
                format!("two nodes share the name '{name}'"),
            ));
        }

        // Port declarations: unique per side.
        for (name, node) in &self.nodes {
            for port in node.inputs().iter().map(PortSpec::name).duplicates() {
                issues.push(Issue::error(
                    IssueCode::DupPort,
                    format!("node '{name}' declares input port '{port}' twice"),
                ));
            }
            for port in node.outputs().iter().map(PortSpec::name).duplicates() {
                issues.push(Issue::error(
                    IssueCode::DupPort,
                    format!("node '{name}' declares output port '{port}' twice"),
                ));
            }
        }

        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (n.as_str(), i))
            .collect();

        // Edges.
        for id in self.edges.iter().map(|e| &e.id).duplicates() {
            issues.push(Issue::error(
                IssueCode::DupEdge,
                format!("two edges share the id '{id}'"),
            ));
        }
        for spec in &self.edges {
            if spec.capacity == 0 {
                issues.push(Issue::error(
                    IssueCode::BadCap,
                    format!("edge '{}' has capacity 0", spec.id),
                ));
            }
            let src_schema = match index.get(spec.src.node.as_str()) {
                None => {
                    issues.push(Issue::error(
                        IssueCode::UnknownNode,
                        format!("edge '{}' references missing node '{}'", spec.id, spec.src.node),
                    ));
                    None
                }
                Some(&ix) => {
                    let outputs = self.nodes[ix].1.outputs();
                    match outputs.iter().find(|p| p.name() == spec.src.port) {
                        None => {
                            issues.push(Issue::error(
                                IssueCode::NoSrcPort,
                                format!("node '{}' has no output port '{}'", spec.src.node, spec.src.port),
                            ));
                            None
                        }
                        Some(port) => port.schema().cloned(),
                    }
                }
            };
            let dst_schema = match index.get(spec.dst.node.as_str()) {
                None => {
                    issues.push(Issue::error(
                        IssueCode::UnknownNode,
                        format!("edge '{}' references missing node '{}'", spec.id, spec.dst.node),
                    ));
                    None
                }
                Some(&ix) => {
                    let inputs = self.nodes[ix].1.inputs();
                    match inputs.iter().find(|p| p.name() == spec.dst.port) {
                        None => {
                            issues.push(Issue::error(
                                IssueCode::NoDstPort,
                                format!("node '{}' has no input port '{}'", spec.dst.node, spec.dst.port),
                            ));
                            None
                        }
                        Some(port) => port.schema().cloned(),
                    }
                }
            };
            if let (Some(src), Some(dst)) = (&src_schema, &dst_schema) {
                if !src.compatible(dst) {
                    issues.push(Issue::error(
                        IssueCode::TypeMismatch,
                        format!(
                            "edge '{}' connects schema '{}' to incompatible schema '{}'",
                            spec.id,
                            src.label(),
                            dst.label(),
                        ),
                    ));
                }
            }
        }

        // Exposures.
        for name in self.exposed_inputs.iter().map(|(n, _)| n).duplicates() {
            issues.push(Issue::error(
                IssueCode::DupExposeIn,
                format!("two exposed inputs share the name '{name}'"),
            ));
        }
        for name in self.exposed_outputs.iter().map(|(n, _)| n).duplicates() {
            issues.push(Issue::error(
                IssueCode::DupExposeOut,
                format!("two exposed outputs share the name '{name}'"),
            ));
        }
        for (name, target) in &self.exposed_inputs {
            let valid = index.get(target.node.as_str()).is_some_and(|&ix| {
                self.nodes[ix].1.inputs().iter().any(|p| p.name() == target.port)
            });
            if !valid {
                issues.push(Issue::error(
                    IssueCode::BadExposeIn,
                    format!("exposed input '{name}' targets invalid port {target}"),
                ));
            }
        }
        for (name, source) in &self.exposed_outputs {
            let valid = index.get(source.node.as_str()).is_some_and(|&ix| {
                self.nodes[ix].1.outputs().iter().any(|p| p.name() == source.port)
            });
            if !valid {
                issues.push(Issue::error(
                    IssueCode::BadExposeOut,
                    format!("exposed output '{name}' sources invalid port {source}"),
                ));
            }
        }

        // Best-effort cycle detection.
        if let Some(cycle) = self.find_cycle(&index) {
            issues.push(Issue::warning(
                IssueCode::CycleWarn,
                format!("cycle detected through: {}", cycle.join(" -> ")),
            ));
        }

        issues
    }

    fn resolve_in(&self, ep: Endpoint) -> Endpoint {
        self.aliases_in
            .get(&(ep.node.clone(), ep.port.clone()))
            .cloned()
            .unwrap_or(ep)
    }

    fn resolve_out(&self, ep: Endpoint) -> Endpoint {
        self.aliases_out
            .get(&(ep.node.clone(), ep.port.clone()))
            .cloned()
            .unwrap_or(ep)
    }

    fn find_cycle(&self, index: &HashMap<&str, usize>) -> Option<Vec<String>> {
        let n = self.nodes.len();
        let mut adjacency = vec![Vec::new(); n];
        for spec in &self.edges {
            if let (Some(&s), Some(&d)) = (
                index.get(spec.src.node.as_str()),
                index.get(spec.dst.node.as_str()),
            ) {
                adjacency[s].push(d);
            }
        }

        // Iterative three-color DFS; grey nodes live on `path`.
        let mut color = vec![0u8; n];
        for start in 0..n {
            if color[start] != 0 {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            let mut path = vec![start];
            color[start] = 1;
            while let Some(&(node, cursor)) = stack.last() {
                if cursor < adjacency[node].len() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    let next = adjacency[node][cursor];
                    match color[next] {
                        0 => {
                            color[next] = 1;
                            stack.push((next, 0));
                            path.push(next);
                        }
                        1 => {
                            let pos = path.iter().position(|&x| x == next).unwrap_or(0);
                            return Some(
                                path[pos..]
                                    .iter()
                                    .map(|&ix| self.nodes[ix].0.clone())
                                    .collect(),
                            );
                        }
                        _ => {}
                    }
                } else {
                    color[node] = 2;
                    stack.pop();
                    path.pop();
                }
            }
        }
        None
    }

    pub(crate) fn into_parts(self) -> SubgraphParts {
        SubgraphParts {
            nodes: self.nodes,
            edges: self.edges,
            exposed_inputs: self.exposed_inputs,
            exposed_outputs: self.exposed_outputs,
        }
    }
}

impl fmt::Debug for Subgraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subgraph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}
