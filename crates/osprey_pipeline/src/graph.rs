//! Phase discovery, scheduling and execution.
//!
//! Phases are maximal connected components of the node graph under the
//! undirected push∪pull relation. Phases are ordered by a DAG built from
//! depends-on edges (lifted to component representatives) and executed in a
//! deterministic topological order: ties always break toward the phase
//! discovered first. Within a phase, nodes are ordered by the directed
//! push∪pull DAG (pushes producer→consumer, pulls producer→consumer after
//! flipping the pull relation) and the unique initiator drives execution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use osprey_common::error::{OspreyResult, PipelineError};
use osprey_common::progress::{FractionalProgress, Progress};
use osprey_common::Runtime;

use crate::node::{ControlFlow, Operator};
use crate::tokens::{Forward, NodeId, NodeMap, Relation};

/// Reserved forwarding key carrying the expected item count.
pub const ITEMS_KEY: &str = "items";

/// One scheduled phase.
#[derive(Debug, Clone)]
pub struct PhaseInfo {
    /// Name of the highest-priority node, for humans.
    pub name: String,
    /// Stable identifier for the time predictor.
    pub uid: String,
    /// Node ids in topological order.
    pub nodes: Vec<NodeId>,
    pub initiator: NodeId,
    /// Forwarding edges (from, to) inside this phase.
    pub successors: Vec<(NodeId, NodeId)>,
    /// Evacuate the previous phase's nodes before running this one.
    pub evacuate_previous: bool,
}

/// The full execution schedule.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub phases: Vec<PhaseInfo>,
}

// ── Disjoint sets ────────────────────────────────────────────────────────────

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

// ── Planning ─────────────────────────────────────────────────────────────────

/// Compute the phase schedule for everything registered in `map`.
pub fn plan(map: &NodeMap) -> OspreyResult<PhasePlan> {
    let ids = map.ids();
    let relations = map.relations();
    let index: HashMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Phase discovery: connected components under push∪pull.
    let mut sets = DisjointSets::new(ids.len());
    for &(a, b, rel) in &relations {
        if rel != Relation::Depends {
            sets.union(index[&a], index[&b]);
        }
    }

    // Number phases in discovery order of their first node.
    let mut phase_of_rep: HashMap<usize, usize> = HashMap::new();
    let mut phase_nodes: Vec<Vec<NodeId>> = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        let rep = sets.find(i);
        let phase = *phase_of_rep.entry(rep).or_insert_with(|| {
            phase_nodes.push(Vec::new());
            phase_nodes.len() - 1
        });
        phase_nodes[phase].push(id);
    }
    let phase_count = phase_nodes.len();
    let phase_of = |sets: &mut DisjointSets, id: NodeId| phase_of_rep[&sets.find(index[&id])];

    // Phase DAG from depends edges: the depended-on phase runs first.
    let mut dag_edges: HashSet<(usize, usize)> = HashSet::new();
    for &(a, b, rel) in &relations {
        if rel == Relation::Depends {
            let pa = phase_of(&mut sets, a);
            let pb = phase_of(&mut sets, b);
            if pa == pb {
                return Err(PipelineError::PhaseCycle(phase_name(map, &phase_nodes[pa])).into());
            }
            dag_edges.insert((pb, pa));
        }
    }

    // Deterministic topological order of phases (Kahn, ties by discovery).
    let mut indegree = vec![0usize; phase_count];
    for &(_, to) in &dag_edges {
        indegree[to] += 1;
    }
    let mut ready: BTreeSet<usize> = (0..phase_count).filter(|&p| indegree[p] == 0).collect();
    let mut order = Vec::with_capacity(phase_count);
    while let Some(p) = ready.pop_first() {
        order.push(p);
        for &(from, to) in &dag_edges {
            if from == p {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }
    }
    if order.len() != phase_count {
        let stuck = (0..phase_count)
            .find(|p| !order.contains(p))
            .unwrap_or_default();
        return Err(PipelineError::PhaseCycle(phase_name(map, &phase_nodes[stuck])).into());
    }

    // Assemble per-phase schedules in execution order.
    let mut phases = Vec::with_capacity(phase_count);
    for (pos, &p) in order.iter().enumerate() {
        let mut info = plan_phase(map, &phase_nodes[p], &relations)?;
        info.evacuate_previous = pos > 0 && !dag_edges.contains(&(order[pos - 1], p));
        phases.push(info);
    }
    tracing::debug!(
        phases = ?phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "pipeline schedule"
    );
    Ok(PhasePlan { phases })
}

/// Topologically order one phase's nodes and identify its initiator.
fn plan_phase(
    map: &NodeMap,
    nodes: &[NodeId],
    relations: &[(NodeId, NodeId, Relation)],
) -> OspreyResult<PhaseInfo> {
    let members: HashSet<NodeId> = nodes.iter().copied().collect();
    let name = phase_name(map, nodes);

    // Directed edges for the in-phase order: a push goes producer→consumer
    // as written; a pull is recorded consumer→producer and flips.
    let mut successors: Vec<(NodeId, NodeId)> = Vec::new();
    // In-degree under the raw relations finds the initiator.
    let mut relation_indegree: HashMap<NodeId, usize> =
        nodes.iter().map(|&id| (id, 0)).collect();
    for &(a, b, rel) in relations {
        if !members.contains(&a) || !members.contains(&b) {
            continue;
        }
        match rel {
            Relation::Pushes => {
                successors.push((a, b));
                *relation_indegree.get_mut(&b).unwrap() += 1;
            }
            Relation::Pulls => {
                successors.push((b, a));
                *relation_indegree.get_mut(&b).unwrap() += 1;
            }
            Relation::Depends => {}
        }
    }

    let mut initiators: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|id| relation_indegree[id] == 0)
        .collect();
    initiators.sort_unstable();
    let initiator = match initiators.len() {
        0 => return Err(PipelineError::NoInitiator(name).into()),
        1 => initiators[0],
        _ => return Err(PipelineError::MultipleInitiators(name).into()),
    };

    // Kahn order over the successor edges, ties by discovery (id) order.
    let mut indegree: HashMap<NodeId, usize> = nodes.iter().map(|&id| (id, 0)).collect();
    for &(_, to) in &successors {
        *indegree.get_mut(&to).unwrap() += 1;
    }
    let mut ready: BTreeSet<NodeId> = nodes
        .iter()
        .copied()
        .filter(|id| indegree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &(from, to) in &successors {
            if from == id {
                let d = indegree.get_mut(&to).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.insert(to);
                }
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(PipelineError::NodeCycle(name).into());
    }

    let uid = {
        let mut parts: Vec<String> = order
            .iter()
            .map(|&id| {
                map.with_entry(id, |e| e.name.clone())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect();
        parts.sort();
        parts.join(":")
    };

    Ok(PhaseInfo {
        name,
        uid,
        nodes: order,
        initiator,
        successors,
        evacuate_previous: false,
    })
}

/// The phase borrows the name of its highest-priority node.
fn phase_name(map: &NodeMap, nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .filter_map(|&id| map.with_entry(id, |e| (e.priority, e.name.clone())))
        .max_by_key(|(priority, _)| *priority)
        .map(|(_, name)| name)
        .unwrap_or_else(|| "unnamed".to_string())
}

// ── Execution ────────────────────────────────────────────────────────────────

/// Find the node `id` across the pipeline's chains and run `f` on it.
fn with_node<R>(
    chains: &mut [Box<dyn ControlFlow>],
    id: NodeId,
    f: impl FnOnce(&mut dyn Operator) -> R,
) -> OspreyResult<R> {
    let mut f = Some(f);
    let mut result = None;
    for chain in chains.iter_mut() {
        chain.visit(&mut |op| {
            if op.token().id() == id {
                if let Some(f) = f.take() {
                    result = Some(f(op));
                }
                true
            } else {
                false
            }
        });
        if result.is_some() {
            break;
        }
    }
    result.ok_or_else(|| PipelineError::UnknownNode(id).into())
}

/// Copy everything node `from` was forwarded, plus everything it forwards
/// itself, into `to`'s inbox. The node's own values win on key conflicts.
fn propagate_forwards(map: &NodeMap, from: NodeId, to: NodeId) {
    let values: Vec<(String, Forward)> = map
        .with_entry(from, |e| {
            e.inbox
                .iter()
                .chain(e.outbox.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    map.with_entry(to, |e| {
        for (k, v) in values {
            e.inbox.insert(k, v);
        }
    });
}

/// Distribute `budget` over a phase's nodes: nodes whose proportional share
/// falls below their minimum are pinned at the minimum (at most `n` passes
/// reach the fixed point), then the remainder is split proportionally.
fn assign_memory(
    chains: &mut [Box<dyn ControlFlow>],
    map: &NodeMap,
    phase: &PhaseInfo,
    budget: u64,
) -> OspreyResult<()> {
    let requests: Vec<(NodeId, f64, u64)> = phase
        .nodes
        .iter()
        .filter_map(|&id| map.with_entry(id, |e| (id, e.memory_fraction, e.minimum_memory)))
        .collect();
    let minimum_sum: u64 = requests.iter().map(|&(_, _, min)| min).sum();

    let mut grants: HashMap<NodeId, u64> = HashMap::new();
    if minimum_sum > budget {
        tracing::warn!(
            phase = %phase.name,
            budget,
            minimum = minimum_sum,
            "phase minimum memory exceeds the budget; assigning minima anyway"
        );
        for &(id, _, min) in &requests {
            grants.insert(id, min);
        }
    } else {
        let mut remaining = budget;
        let mut fraction_sum: f64 = requests.iter().map(|&(_, f, _)| f).sum();
        let mut pinned: HashSet<NodeId> = HashSet::new();
        // Each pass either pins at least one node at its minimum or is the
        // last, so the loop is a fixed point after at most n+1 passes.
        for _ in 0..=requests.len() {
            let mut changed = false;
            for &(id, frac, min) in &requests {
                if pinned.contains(&id) {
                    continue;
                }
                let share = if fraction_sum <= f64::EPSILON {
                    0.0
                } else {
                    frac / fraction_sum * remaining as f64
                };
                if (share as u64) < min {
                    grants.insert(id, min);
                    pinned.insert(id);
                    remaining = remaining.saturating_sub(min);
                    fraction_sum -= frac;
                    changed = true;
                }
            }
            if !changed {
                for &(id, frac, _) in &requests {
                    if !pinned.contains(&id) {
                        let share = if fraction_sum <= f64::EPSILON {
                            0
                        } else {
                            (frac / fraction_sum * remaining as f64) as u64
                        };
                        grants.insert(id, share);
                    }
                }
                break;
            }
        }
    }

    for &id in &phase.nodes {
        let grant = grants.get(&id).copied().unwrap_or(0);
        with_node(chains, id, |op| op.set_available_memory(grant))?;
    }
    Ok(())
}

/// Run one phase: prepare → memory → begin (forwarding) → go → end.
/// On failure, `end` still runs on every node that saw `begin`, with
/// cleanup errors logged and suppressed.
fn run_phase(
    chains: &mut [Box<dyn ControlFlow>],
    map: &NodeMap,
    phase: &PhaseInfo,
    items: u64,
    budget: u64,
    sub: &mut dyn Progress,
) -> OspreyResult<()> {
    for &id in &phase.nodes {
        with_node(chains, id, |op| op.prepare())??;
    }
    assign_memory(chains, map, phase, budget)?;

    // The initiator learns the expected item count through the reserved key.
    map.with_entry(phase.initiator, |e| {
        e.inbox
            .insert(ITEMS_KEY.to_string(), Arc::new(items) as Forward);
    });

    let mut begun: Vec<NodeId> = Vec::with_capacity(phase.nodes.len());
    let run = (|| -> OspreyResult<()> {
        for &id in &phase.nodes {
            with_node(chains, id, |op| op.begin())??;
            begun.push(id);
            for &(from, to) in &phase.successors {
                if from == id {
                    propagate_forwards(map, from, to);
                }
            }
        }
        let steps: u64 = phase
            .nodes
            .iter()
            .filter_map(|&id| map.with_entry(id, |e| e.steps))
            .sum();
        sub.init(steps.max(items).max(1));
        with_node(chains, phase.initiator, |op| op.go(sub))??;
        Ok(())
    })();

    match run {
        Ok(()) => {
            let mut first_error = None;
            for &id in begun.iter().rev() {
                match with_node(chains, id, |op| op.end())? {
                    Ok(()) => {}
                    Err(err) if first_error.is_none() => first_error = Some(err),
                    Err(err) => {
                        tracing::warn!(phase = %phase.name, %err, "suppressed error in end");
                    }
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => {
                    sub.done();
                    Ok(())
                }
            }
        }
        Err(err) => {
            for &id in begun.iter().rev() {
                let cleanup = with_node(chains, id, |op| op.end());
                if let Ok(Err(cleanup_err)) = cleanup {
                    tracing::warn!(phase = %phase.name, err = %cleanup_err,
                        "suppressed error while unwinding phase");
                }
            }
            Err(err)
        }
    }
}

/// Execute a full plan: fractional progress across phases, evacuation
/// between phases, the time predictor fed with measured durations.
pub fn execute(
    chains: &mut [Box<dyn ControlFlow>],
    map: &NodeMap,
    plan: &PhasePlan,
    items: u64,
    progress: &mut dyn Progress,
    memory: u64,
    rt: &Runtime,
) -> OspreyResult<()> {
    let mut fp = FractionalProgress::new(progress);
    for phase in &plan.phases {
        fp.add_phase(phase.uid.clone(), phase.name.clone(), items, rt.predictor());
    }
    fp.init();

    for (i, phase) in plan.phases.iter().enumerate() {
        if phase.evacuate_previous {
            for &id in &plan.phases[i - 1].nodes {
                with_node(chains, id, |op| {
                    if op.can_evacuate() {
                        op.evacuate();
                    }
                })?;
            }
        }
        let mut sub = fp.enter_phase(i);
        let result = run_phase(chains, map, phase, items, memory, &mut sub);
        sub.finish(rt.predictor());
        result?;
    }

    fp.done();
    if let Err(err) = rt.predictor().store() {
        tracing::warn!(%err, "failed to persist time predictions");
    }
    Ok(())
}

// ── Plots ────────────────────────────────────────────────────────────────────

/// GraphViz dump of the node graph.
pub fn plot(map: &NodeMap, out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(out, "digraph pipeline {{")?;
    for id in map.ids() {
        let name = map.with_entry(id, |e| e.name.clone()).unwrap_or_default();
        writeln!(out, "  n{id} [label=\"{name}\"];")?;
    }
    for (a, b, rel) in map.relations() {
        let style = match rel {
            Relation::Pushes => "",
            Relation::Pulls => " [style=dashed]",
            Relation::Depends => " [style=dotted]",
        };
        writeln!(out, "  n{a} -> n{b}{style};")?;
    }
    writeln!(out, "}}")
}

/// GraphViz dump of the phase DAG in execution order.
pub fn plot_phases(plan: &PhasePlan, out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(out, "digraph phases {{")?;
    for (i, phase) in plan.phases.iter().enumerate() {
        writeln!(out, "  p{i} [label=\"{}\"];", phase.name)?;
        if i > 0 {
            writeln!(out, "  p{} -> p{i};", i - 1)?;
        }
    }
    writeln!(out, "}}")
}
