//! Effective step timings and routing timing aggregates.
//!
//! A step's effective timing is its override where set, else the default of
//! its process segment as reported by the [`ProcessSegmentCatalog`] at call
//! time. A step whose override is complete never consults the catalog.

use std::collections::BTreeMap;

use crate::collaborators::ProcessSegmentCatalog;
use crate::error::{RoutingError, RoutingResult};
use crate::graph::DependencyGraph;
use crate::types::{
    ProcessSegmentId, RoutingAggregate, RoutingStep, RoutingTiming, SegmentTiming, StepId,
};

/// Effective timings of a routing's steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTimings {
    /// Timing per resolvable step.
    pub timings: BTreeMap<StepId, SegmentTiming>,
    /// Steps whose segment is unknown and whose override is incomplete.
    pub unresolved: Vec<(StepId, ProcessSegmentId)>,
}

/// Resolve every step's effective timing.
///
/// Each distinct segment is looked up once per call.
pub async fn resolve_step_timings<C>(catalog: &C, steps: &[RoutingStep]) -> RoutingResult<ResolvedTimings>
where
    C: ProcessSegmentCatalog + ?Sized,
{
    let mut defaults: BTreeMap<ProcessSegmentId, Option<SegmentTiming>> = BTreeMap::new();
    let mut resolved = ResolvedTimings::default();

    for step in steps {
        if step.timing.is_complete() {
            resolved
                .timings
                .insert(step.id, step.timing.resolve(SegmentTiming::default()));
            continue;
        }
        let default = match defaults.get(&step.process_segment) {
            Some(cached) => *cached,
            None => {
                let looked_up = catalog
                    .segment_timing(&step.process_segment)
                    .await
                    .map_err(RoutingError::from_collaborator)?;
                defaults.insert(step.process_segment.clone(), looked_up);
                looked_up
            }
        };
        match default {
            Some(default) => {
                resolved.timings.insert(step.id, step.timing.resolve(default));
            }
            None => resolved
                .unresolved
                .push((step.id, step.process_segment.clone())),
        }
    }
    Ok(resolved)
}

/// Totals and critical path of a routing given its effective step timings.
pub fn routing_timing(
    aggregate: &RoutingAggregate,
    timings: &BTreeMap<StepId, SegmentTiming>,
) -> RoutingResult<RoutingTiming> {
    let graph = DependencyGraph::from_aggregate(aggregate);
    let pass = graph.forward_pass(timings)?;

    let mut totals = RoutingTiming::default();
    for step in &aggregate.steps {
        let timing = timings.get(&step.id).copied().unwrap_or_default();
        let overflow = || RoutingError::TimingOverflow { step: step.id };
        totals.total_setup_secs = totals
            .total_setup_secs
            .checked_add(timing.setup_secs)
            .ok_or_else(overflow)?;
        totals.total_cycle_secs = totals
            .total_cycle_secs
            .checked_add(timing.cycle_secs)
            .ok_or_else(overflow)?;
        totals.total_teardown_secs = totals
            .total_teardown_secs
            .checked_add(timing.teardown_secs)
            .ok_or_else(overflow)?;
        totals.total_secs = timing
            .checked_total()
            .and_then(|t| totals.total_secs.checked_add(t))
            .ok_or_else(overflow)?;
    }
    totals.critical_path_secs = pass.critical_path_secs;
    totals.critical_path = pass.critical_path;
    totals.schedule = pass.schedule;
    Ok(totals)
}

/// Resolve timings and compute the routing aggregate.
///
/// Fails with `ProcessSegmentNotFound` for the first step that cannot be
/// timed.
pub async fn compute_timing<C>(catalog: &C, aggregate: &RoutingAggregate) -> RoutingResult<RoutingTiming>
where
    C: ProcessSegmentCatalog + ?Sized,
{
    let resolved = resolve_step_timings(catalog, &aggregate.steps).await?;
    if let Some((_, segment)) = resolved.unresolved.into_iter().next() {
        return Err(RoutingError::ProcessSegmentNotFound(segment));
    }
    routing_timing(aggregate, &resolved.timings)
}
