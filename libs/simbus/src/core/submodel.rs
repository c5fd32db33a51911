//! Dependency analysis and execution ordering.
//!
//! Nodes are `(element, out group)` pairs. Each element contributes a
//! dependency matrix; every dependent input with a live (non-decoupled,
//! active) connection adds an edge from the producing node. Tarjan's
//! algorithm groups the nodes; groups of size greater than one are
//! algebraic loops and are broken by decoupling the connection bundle
//! with the highest decouple priority, then the analysis reruns until
//! the graph is acyclic.

use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info, warn};

use crate::core::connection::{Connection, DecouplePolicy};
use crate::core::element::ElementHarness;
use crate::core::error::{Result, SimbusError};

pub type ElementRef = Arc<Mutex<ElementHarness>>;

/// Which dependency matrices drive the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyPhase {
    Initial,
    Runtime,
}

/// One entry of the evaluation list.
#[derive(Clone)]
pub struct EvalNode {
    pub element: ElementRef,
    pub element_index: usize,
    pub group: usize,
}

/// An ordered evaluation list plus the unique elements it covers, in
/// evaluation order.
pub struct SubModel {
    pub evaluation_list: Vec<EvalNode>,
    pub elements: Vec<(usize, ElementRef)>,
}

impl SubModel {
    pub fn contains_element(&self, element_index: usize) -> bool {
        self.elements.iter().any(|(idx, _)| *idx == element_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    element: usize,
    group: usize,
}

/// Everything the graph construction needs from one element, captured
/// under a single lock.
struct ElementFacts {
    sequence_number: i32,
    num_in: usize,
    num_out: usize,
    groups: usize,
    deps: crate::core::dependency::DependencyMatrix,
    /// Per input: the incoming connection, if any.
    in_connections: Vec<Option<Arc<Connection>>>,
    /// Per input: whether an initial value is declared.
    in_has_initial: Vec<bool>,
    /// Per output: exact declared initial value.
    out_initial_exact: Vec<bool>,
    /// Out group per output channel.
    out_groups: Vec<usize>,
    /// All outgoing connections (for loop breaking).
    out_connections: Vec<Arc<Connection>>,
}

fn collect_facts(elements: &[ElementRef], phase: DependencyPhase) -> Vec<ElementFacts> {
    elements
        .iter()
        .map(|element| {
            let harness = element.lock();
            let databus = harness.databus();
            let num_in = databus.num_in_channels();
            let num_out = databus.num_out_channels();

            let (groups, deps, out_groups) = match phase {
                DependencyPhase::Initial => {
                    // an element without outputs still takes part in the
                    // initialisation ordering through one dummy group
                    let groups = harness.num_initial_out_groups().max(1);
                    let out_groups = (0..num_out)
                        .map(|i| harness.initial_out_group_of(i))
                        .collect();
                    (groups, harness.initial_dependency_matrix(), out_groups)
                }
                DependencyPhase::Runtime => {
                    let out_groups = (0..num_out).map(|i| harness.out_group_of(i)).collect();
                    (
                        harness.num_out_groups(),
                        harness.dependency_matrix(),
                        out_groups,
                    )
                }
            };

            let in_connections = (0..num_in)
                .map(|i| {
                    databus
                        .input(i)
                        .and_then(|port| port.connection().cloned())
                })
                .collect();
            let in_has_initial = (0..num_in)
                .map(|i| {
                    databus
                        .in_info()
                        .info(i)
                        .is_some_and(|info| info.initial_value.is_some())
                })
                .collect();
            let out_initial_exact = (0..num_out)
                .map(|i| {
                    databus.out_info().info(i).is_some_and(|info| {
                        info.initial_value_is_exact && info.initial_value.is_some()
                    })
                })
                .collect();
            let out_connections = (0..num_out)
                .flat_map(|i| {
                    databus
                        .output(i)
                        .map(|port| port.connections().to_vec())
                        .unwrap_or_default()
                })
                .collect();

            ElementFacts {
                sequence_number: harness.sequence_number(),
                num_in,
                num_out,
                groups,
                deps,
                in_connections,
                in_has_initial,
                out_initial_exact,
                out_groups,
                out_connections,
            }
        })
        .collect()
}

fn build_nodes(facts: &[ElementFacts]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (element, fact) in facts.iter().enumerate() {
        for group in 0..fact.groups {
            nodes.push(Node { element, group });
        }
    }
    nodes
}

fn node_id(nodes: &[Node], element: usize, group: usize) -> Option<usize> {
    nodes
        .iter()
        .position(|n| n.element == element && n.group == group)
}

/// Build the effective dependency graph over `nodes`.
fn build_graph(
    facts: &[ElementFacts],
    nodes: &[Node],
    phase: DependencyPhase,
) -> Result<DiGraph<usize, ()>> {
    let mut graph = DiGraph::new();
    for i in 0..nodes.len() {
        graph.add_node(i);
    }

    for (target_id, node) in nodes.iter().enumerate() {
        let fact = &facts[node.element];

        for in_channel in 0..fact.num_in {
            let mut dependency = fact.deps.get(in_channel, node.group)?;

            if phase == DependencyPhase::Initial && fact.in_has_initial[in_channel] {
                // initial inputs are exact; only a live coupled
                // connection can still impose an ordering
                match &fact.in_connections[in_channel] {
                    Some(connection) if !connection.is_decoupled() => {}
                    _ => dependency = crate::core::dependency::Dependency::Independent,
                }
            }

            if !dependency.is_dependent() {
                continue;
            }

            let Some(connection) = &fact.in_connections[in_channel] else {
                continue;
            };

            let selectable = matches!(
                connection.info().decouple,
                DecouplePolicy::Never | DecouplePolicy::IfNeeded(_)
            );
            if !selectable || connection.is_decoupled() || !connection.is_active_dependency() {
                continue;
            }

            let endpoints = connection.info().endpoints;
            let source_fact = &facts[endpoints.source_element];
            let source_group = source_fact
                .out_groups
                .get(endpoints.source_port)
                .copied()
                .unwrap_or(0);

            let Some(source_id) = node_id(nodes, endpoints.source_element, source_group) else {
                // source is not part of this analysis: no dependency
                continue;
            };

            if phase == DependencyPhase::Initial
                && fact.num_out > 0
                && fact.out_initial_exact.get(node.group).copied().unwrap_or(false)
            {
                // the target output has an exact initial value
                continue;
            }

            debug!(
                "dependency ({},{}) -> ({},{})",
                endpoints.source_element, source_group, node.element, node.group
            );
            graph.add_edge(
                NodeIndex::new(source_id),
                NodeIndex::new(target_id),
                (),
            );
        }
    }

    Ok(graph)
}

/// Strongly connected components, sources first. A singleton component
/// is a loop only when it carries a self-edge.
fn ordered_components(graph: &DiGraph<usize, ()>) -> Vec<(Vec<usize>, bool)> {
    let mut sccs = petgraph::algo::tarjan_scc(graph);
    // tarjan emits reverse topological order; evaluation wants sources first
    sccs.reverse();
    sccs.into_iter()
        .map(|component| {
            let is_loop = component.len() > 1
                || graph.contains_edge(component[0], component[0]);
            (
                component.into_iter().map(|n| graph[n]).collect(),
                is_loop,
            )
        })
        .collect()
}

/// Select and decouple one connection bundle per loop.
///
/// For each ordered element pair inside the loop the bundle of
/// connections from the first to the second is scored: a bundle running
/// against the declaration order wins outright, a bundle containing a
/// `Never` connection is discarded, otherwise the highest `IfNeeded`
/// priority counts. The best bundle is decoupled completely.
fn decouple_loops(
    facts: &[ElementFacts],
    nodes: &[Node],
    loops: &[Vec<usize>],
) -> Result<()> {
    for loop_nodes in loops {
        let mut loop_elements: Vec<usize> = loop_nodes
            .iter()
            .map(|&n| nodes[n].element)
            .collect();
        loop_elements.sort_unstable();
        loop_elements.dedup();

        let mut best: Option<(usize, usize)> = None;
        let mut best_priority: i64 = -1;

        'pairs: for &from in &loop_elements {
            for &to in &loop_elements {
                if best_priority >= i32::MAX as i64 {
                    break 'pairs;
                }

                let mut local_priority: i64 = -1;
                for connection in bundle(facts, from, to) {
                    if connection.is_decoupled() {
                        continue;
                    }
                    if matches!(connection.info().decouple, DecouplePolicy::Never) {
                        // a never-decouple connection discards the bundle
                        local_priority = -1;
                        break;
                    }
                    if facts[from].sequence_number > facts[to].sequence_number {
                        // ordering by declaration wins over priorities
                        local_priority = i32::MAX as i64;
                        break;
                    }
                    if let DecouplePolicy::IfNeeded(priority) = connection.info().decouple {
                        local_priority = local_priority.max(priority as i64);
                    }
                }

                if local_priority > best_priority {
                    best = Some((from, to));
                    best_priority = local_priority;
                }
            }
        }

        let Some((from, to)) = best else {
            warn!("no connection of an algebraic loop can be decoupled");
            return Err(SimbusError::Scheduling(
                "no connection can be decoupled".into(),
            ));
        };

        for connection in bundle(facts, from, to) {
            connection.log_decoupled();
            connection.set_decoupled();
        }
    }

    Ok(())
}

fn bundle<'a>(
    facts: &'a [ElementFacts],
    from: usize,
    to: usize,
) -> impl Iterator<Item = &'a Arc<Connection>> {
    facts[from]
        .out_connections
        .iter()
        .filter(move |c| c.info().endpoints.target_element == to)
}

/// Order `elements` for `phase`, breaking algebraic loops by
/// decoupling. The decouple marks are global: a connection decoupled
/// here stays decoupled for the rest of the run.
pub fn create_sub_model(elements: &[ElementRef], phase: DependencyPhase) -> Result<SubModel> {
    let nodes_total: usize;
    let order = {
        let facts = collect_facts(elements, phase);
        let nodes = build_nodes(&facts);
        nodes_total = nodes.len();
        if nodes_total == 0 {
            warn!("no outports in elements");
        }

        let mut rounds = 0usize;
        loop {
            let graph = build_graph(&facts, &nodes, phase)?;
            let components = ordered_components(&graph);

            let loops: Vec<Vec<usize>> = components
                .iter()
                .filter(|(_, is_loop)| *is_loop)
                .map(|(nodes, _)| nodes.clone())
                .collect();

            if loops.is_empty() {
                break components
                    .into_iter()
                    .flat_map(|(group, _)| group)
                    .map(|n| nodes[n])
                    .collect::<Vec<_>>();
            }

            decouple_loops(&facts, &nodes, &loops)?;

            rounds += 1;
            if rounds > nodes_total + 1 {
                return Err(SimbusError::Scheduling(
                    "loop breaking did not converge".into(),
                ));
            }
        }
    };

    let mut evaluation_list = Vec::with_capacity(order.len());
    let mut unique = Vec::new();
    for node in order {
        evaluation_list.push(EvalNode {
            element: Arc::clone(&elements[node.element]),
            element_index: node.element,
            group: node.group,
        });
        if !unique.iter().any(|(idx, _)| *idx == node.element) {
            unique.push((node.element, Arc::clone(&elements[node.element])));
        }
    }

    log_evaluation_order(&evaluation_list);

    Ok(SubModel {
        evaluation_list,
        elements: unique,
    })
}

fn log_evaluation_order(evaluation_list: &[EvalNode]) {
    for (position, node) in evaluation_list.iter().enumerate() {
        let harness = node.element.lock();
        info!(
            " {:2}. ({}, {})",
            position + 1,
            harness.name(),
            node.group
        );
    }
}
