//! Dependency graph engine.
//!
//! A routing's steps and precedence edges are loaded into an explicit
//! adjacency structure, keyed by step id, for cycle checks and critical-path
//! computation. Routings hold tens of steps, so every check is a plain
//! O(V + E) traversal over the in-memory graph.
//!
//! ## Cycle check
//!
//! Before inserting `predecessor -> successor`, a breadth-first search starts
//! at `successor` and follows existing outgoing edges. If `predecessor` is
//! reachable the edge would close a cycle and is rejected, reporting the
//! existing path that the new edge would close.
//!
//! ## Critical path
//!
//! A forward pass in topological order computes each step's earliest start
//! and finish. Finish-to-start edges make the successor wait for the
//! predecessor's finish; the other precedence types are honoured as
//!
//! | Type | Constraint |
//! |------|------------|
//! | FS | `start(s) >= finish(p)` |
//! | SS | `start(s) >= start(p)` |
//! | FF | `finish(s) >= finish(p)` |
//! | SF | `finish(s) >= start(p)` |
//!
//! with starts clamped at zero. Steps without incoming edges start at zero,
//! i.e. unconnected steps are treated as parallel. The critical path length
//! is the maximum earliest finish.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{RoutingError, RoutingResult};
use crate::types::{DependencyType, RoutingAggregate, SegmentTiming, StepId, StepSchedule};

/// Result of the forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardPass {
    /// Earliest start/finish per step.
    pub schedule: BTreeMap<StepId, StepSchedule>,
    /// Steps on the critical path, first to last.
    pub critical_path: Vec<StepId>,
    /// Maximum earliest finish.
    pub critical_path_secs: u64,
}

/// Adjacency structure for one routing's steps.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Step -> insertion rank, used to break ties deterministically.
    ranks: BTreeMap<StepId, usize>,
    /// Predecessor -> (successor -> type).
    successors: BTreeMap<StepId, BTreeMap<StepId, DependencyType>>,
    /// Successor -> (predecessor -> type).
    predecessors: BTreeMap<StepId, BTreeMap<StepId, DependencyType>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a routing's steps (in step-number order) and edges.
    ///
    /// Edges are taken as stored; stored graphs are acyclic because every
    /// insertion went through [`DependencyGraph::check_edge`].
    pub fn from_aggregate(aggregate: &RoutingAggregate) -> Self {
        let mut steps: Vec<_> = aggregate.steps.iter().collect();
        steps.sort_by_key(|s| s.step_number);

        let mut graph = Self::new();
        for step in steps {
            graph.add_step(step.id);
        }
        for dep in &aggregate.dependencies {
            graph.insert_edge_unchecked(dep.predecessor, dep.successor, dep.dependency_type);
        }
        graph
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// True when the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.successors.values().map(|m| m.len()).sum()
    }

    /// Whether `step` is part of the graph.
    pub fn contains(&self, step: &StepId) -> bool {
        self.ranks.contains_key(step)
    }

    /// Add a step. Re-adding an existing step is a no-op.
    pub fn add_step(&mut self, step: StepId) {
        let next = self.ranks.len();
        self.ranks.entry(step).or_insert(next);
    }

    /// Remove a step and every edge touching it.
    pub fn remove_step(&mut self, step: &StepId) {
        self.ranks.remove(step);
        if let Some(succs) = self.successors.remove(step) {
            for succ in succs.keys() {
                if let Some(preds) = self.predecessors.get_mut(succ) {
                    preds.remove(step);
                }
            }
        }
        if let Some(preds) = self.predecessors.remove(step) {
            for pred in preds.keys() {
                if let Some(succs) = self.successors.get_mut(pred) {
                    succs.remove(step);
                }
            }
        }
    }

    /// Whether an edge `predecessor -> successor` exists.
    pub fn has_edge(&self, predecessor: &StepId, successor: &StepId) -> bool {
        self.successors
            .get(predecessor)
            .map(|m| m.contains_key(successor))
            .unwrap_or(false)
    }

    /// Direct successors of `step`.
    pub fn successors_of(&self, step: &StepId) -> impl Iterator<Item = &StepId> {
        self.successors.get(step).into_iter().flat_map(|m| m.keys())
    }

    /// Direct predecessors of `step`.
    pub fn predecessors_of(&self, step: &StepId) -> impl Iterator<Item = &StepId> {
        self.predecessors.get(step).into_iter().flat_map(|m| m.keys())
    }

    /// Shortest existing path `from -> ... -> to` following outgoing edges.
    pub fn path_between(&self, from: &StepId, to: &StepId) -> Option<Vec<StepId>> {
        if from == to {
            return Some(vec![*from]);
        }

        let mut parent: BTreeMap<StepId, StepId> = BTreeMap::new();
        let mut visited: BTreeSet<StepId> = BTreeSet::new();
        let mut queue: VecDeque<StepId> = VecDeque::new();
        visited.insert(*from);
        queue.push_back(*from);

        while let Some(current) = queue.pop_front() {
            for next in self.successors_of(&current) {
                if !visited.insert(*next) {
                    continue;
                }
                parent.insert(*next, current);
                if next == to {
                    let mut path = vec![*to];
                    let mut cursor = *to;
                    while let Some(p) = parent.get(&cursor) {
                        path.push(*p);
                        cursor = *p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(*next);
            }
        }
        None
    }

    /// Whether inserting `predecessor -> successor` would close a cycle.
    pub fn would_introduce_cycle(&self, predecessor: &StepId, successor: &StepId) -> bool {
        predecessor == successor || self.path_between(successor, predecessor).is_some()
    }

    /// Validate a prospective edge without inserting it.
    pub fn check_edge(&self, predecessor: &StepId, successor: &StepId) -> RoutingResult<()> {
        if predecessor == successor {
            return Err(RoutingError::SelfDependency { step: *predecessor });
        }
        if !self.contains(predecessor) {
            return Err(RoutingError::StepNotFound(*predecessor));
        }
        if !self.contains(successor) {
            return Err(RoutingError::StepNotFound(*successor));
        }
        if self.has_edge(predecessor, successor) {
            return Err(RoutingError::DuplicateDependency {
                predecessor: *predecessor,
                successor: *successor,
            });
        }
        if let Some(cycle) = self.path_between(successor, predecessor) {
            return Err(RoutingError::CircularDependency {
                predecessor: *predecessor,
                successor: *successor,
                cycle,
            });
        }
        Ok(())
    }

    /// Validate and insert an edge.
    pub fn add_edge(
        &mut self,
        predecessor: StepId,
        successor: StepId,
        dependency_type: DependencyType,
    ) -> RoutingResult<()> {
        self.check_edge(&predecessor, &successor)?;
        self.insert_edge_unchecked(predecessor, successor, dependency_type);
        Ok(())
    }

    /// Remove an edge. Removing edges never introduces a cycle.
    pub fn remove_edge(&mut self, predecessor: &StepId, successor: &StepId) -> bool {
        let removed = self
            .successors
            .get_mut(predecessor)
            .and_then(|m| m.remove(successor))
            .is_some();
        if let Some(preds) = self.predecessors.get_mut(successor) {
            preds.remove(predecessor);
        }
        removed
    }

    fn insert_edge_unchecked(
        &mut self,
        predecessor: StepId,
        successor: StepId,
        dependency_type: DependencyType,
    ) {
        self.successors
            .entry(predecessor)
            .or_default()
            .insert(successor, dependency_type);
        self.predecessors
            .entry(successor)
            .or_default()
            .insert(predecessor, dependency_type);
    }

    /// Kahn's algorithm; ties resolved by insertion rank.
    ///
    /// Returns `None` if the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<StepId>> {
        let mut in_degree: BTreeMap<StepId, usize> = self
            .ranks
            .keys()
            .map(|id| (*id, self.predecessors_of(id).count()))
            .collect();

        let mut ready: BTreeSet<(usize, StepId)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| (self.ranks[id], *id))
            .collect();

        let mut order = Vec::with_capacity(self.ranks.len());
        while let Some(entry) = ready.iter().next().copied() {
            ready.remove(&entry);
            let (_, step) = entry;
            order.push(step);
            for succ in self.successors_of(&step) {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert((self.ranks[succ], *succ));
                    }
                }
            }
        }

        (order.len() == self.ranks.len()).then_some(order)
    }

    /// True when no cycle exists.
    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_some()
    }

    /// Earliest-start forward pass over the DAG.
    ///
    /// Steps missing from `timings` count as zero duration. Fails with
    /// `TimingOverflow` when a finish time does not fit in `u64`.
    pub fn forward_pass(&self, timings: &BTreeMap<StepId, SegmentTiming>) -> RoutingResult<ForwardPass> {
        let order = self.topological_order().ok_or_else(|| {
            RoutingError::Store("stored dependency graph contains a cycle".to_string())
        })?;

        let mut schedule: BTreeMap<StepId, StepSchedule> = BTreeMap::new();
        let mut driver: BTreeMap<StepId, StepId> = BTreeMap::new();

        for step in &order {
            let timing = timings.get(step).copied().unwrap_or_default();
            let overflow = || RoutingError::TimingOverflow { step: *step };
            let duration = timing.checked_total().ok_or_else(overflow)?;

            let mut start = 0u64;
            let mut driving: Option<StepId> = None;
            if let Some(preds) = self.predecessors.get(step) {
                for (pred, dependency_type) in preds {
                    let Some(p) = schedule.get(pred) else { continue };
                    let candidate = match dependency_type {
                        DependencyType::FinishToStart => p.earliest_finish,
                        DependencyType::StartToStart => p.earliest_start,
                        DependencyType::FinishToFinish => p.earliest_finish.saturating_sub(duration),
                        DependencyType::StartToFinish => p.earliest_start.saturating_sub(duration),
                    };
                    if driving.is_none() || candidate > start {
                        start = candidate;
                        driving = Some(*pred);
                    }
                }
            }
            if let Some(pred) = driving {
                driver.insert(*step, pred);
            }
            schedule.insert(
                *step,
                StepSchedule {
                    timing,
                    earliest_start: start,
                    earliest_finish: start.checked_add(duration).ok_or_else(overflow)?,
                },
            );
        }

        // Latest finish wins; ties go to the step earliest in topological order.
        let mut end: Option<(StepId, u64)> = None;
        for step in &order {
            let finish = schedule[step].earliest_finish;
            if end.map_or(true, |(_, best)| finish > best) {
                end = Some((*step, finish));
            }
        }

        let Some((last, critical_path_secs)) = end else {
            return Ok(ForwardPass::default());
        };

        let mut critical_path = vec![last];
        let mut cursor = last;
        while let Some(prev) = driver.get(&cursor) {
            critical_path.push(*prev);
            cursor = *prev;
        }
        critical_path.reverse();

        Ok(ForwardPass {
            schedule,
            critical_path,
            critical_path_secs,
        })
    }
}
