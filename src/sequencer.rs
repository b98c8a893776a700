//! Step sequencer: atomic edits of a routing's steps and dependency edges.
//!
//! Every edit is planned against a freshly loaded aggregate and committed as
//! one change set, so step numbers stay unique and edges never dangle at any
//! observable point. Structural edits require the routing to be in DRAFT.
//! New edges go through the dependency graph's cycle check first.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::graph::DependencyGraph;
use crate::mutation::mutate_routing;
use crate::store::{RoutingChangeSet, RoutingStore};
use crate::types::{
    DependencyId, NewDependency, NewStep, RoutingAggregate, RoutingId, RoutingStep,
    StepDependency, StepId, StepPatch, TimingOverride, MAX_TIMING_SECS,
};

fn ensure_structure_editable(aggregate: &RoutingAggregate) -> RoutingResult<()> {
    let routing = &aggregate.routing;
    if routing.state.allows_structural_edits() {
        Ok(())
    } else {
        Err(RoutingError::StructureLocked {
            routing: routing.id,
            state: routing.state,
        })
    }
}

fn ensure_positive(step_number: u32) -> RoutingResult<()> {
    if step_number == 0 {
        return Err(RoutingError::InvalidStepNumber { step_number });
    }
    Ok(())
}

fn ensure_timing_in_range(timing: &TimingOverride) -> RoutingResult<()> {
    match timing.out_of_range() {
        Some((component, secs)) => Err(RoutingError::InvalidTiming {
            component,
            secs,
            max: MAX_TIMING_SECS,
        }),
        None => Ok(()),
    }
}

/// Outcome of deleting a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRemoval {
    /// The deleted step.
    pub step: RoutingStep,
    /// Edges removed with it.
    pub dependencies_removed: Vec<DependencyId>,
}

/// Step and dependency editor over a routing store.
pub struct StepSequencer<S> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S> Clone for StepSequencer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: RoutingStore> StepSequencer<S> {
    /// Create a sequencer.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    async fn owning_routing(&self, step: &StepId) -> RoutingResult<RoutingId> {
        self.store
            .routing_of_step(step)
            .await?
            .ok_or(RoutingError::StepNotFound(*step))
    }

    /// Add a step to a DRAFT routing.
    pub async fn add_step(&self, routing: &RoutingId, input: NewStep) -> RoutingResult<RoutingStep> {
        ensure_positive(input.step_number)?;
        ensure_timing_in_range(&input.timing)?;

        let (_, step) = mutate_routing(&*self.store, *routing, self.config.max_commit_retries, |agg| {
            ensure_structure_editable(agg)?;
            if agg.step_by_number(input.step_number).is_some() {
                return Err(RoutingError::DuplicateStepNumber {
                    routing: agg.routing.id,
                    step_number: input.step_number,
                });
            }
            let now = Utc::now();
            let step = RoutingStep {
                id: StepId::generate(),
                routing_id: agg.routing.id,
                step_number: input.step_number,
                process_segment: input.process_segment.clone(),
                flags: input.flags,
                timing: input.timing,
                description: input.description.clone(),
                created_at: now,
                updated_at: now,
            };
            let mut changes = RoutingChangeSet::for_aggregate(agg);
            changes.upsert_steps.push(step.clone());
            Ok((changes, step))
        })
        .await?;

        tracing::info!(
            routing_id = %routing,
            step_id = %step.id,
            step_number = step.step_number,
            process_segment = %step.process_segment,
            "Step added"
        );
        Ok(step)
    }

    /// Partially update a step; a new step number must not collide.
    pub async fn update_step(&self, step_id: &StepId, patch: StepPatch) -> RoutingResult<RoutingStep> {
        if let Some(number) = patch.step_number {
            ensure_positive(number)?;
        }
        if let Some(timing) = &patch.timing {
            ensure_timing_in_range(timing)?;
        }
        let routing = self.owning_routing(step_id).await?;

        let (_, step) = mutate_routing(&*self.store, routing, self.config.max_commit_retries, |agg| {
            ensure_structure_editable(agg)?;
            let current = agg.step(step_id).ok_or(RoutingError::StepNotFound(*step_id))?;
            if let Some(number) = patch.step_number {
                if agg
                    .step_by_number(number)
                    .is_some_and(|other| other.id != current.id)
                {
                    return Err(RoutingError::DuplicateStepNumber {
                        routing: agg.routing.id,
                        step_number: number,
                    });
                }
            }
            let updated = patch.apply_to(current, Utc::now());
            let mut changes = RoutingChangeSet::for_aggregate(agg);
            changes.upsert_steps.push(updated.clone());
            Ok((changes, updated))
        })
        .await?;

        tracing::info!(
            routing_id = %routing,
            step_id = %step.id,
            step_number = step.step_number,
            "Step updated"
        );
        Ok(step)
    }

    /// Delete a step together with every edge touching it.
    pub async fn delete_step(&self, step_id: &StepId) -> RoutingResult<StepRemoval> {
        let routing = self.owning_routing(step_id).await?;

        let (_, removal) = mutate_routing(&*self.store, routing, self.config.max_commit_retries, |agg| {
            ensure_structure_editable(agg)?;
            let step = agg
                .step(step_id)
                .cloned()
                .ok_or(RoutingError::StepNotFound(*step_id))?;
            let dependencies_removed: Vec<DependencyId> = agg
                .dependencies
                .iter()
                .filter(|d| d.touches(step_id))
                .map(|d| d.id)
                .collect();

            let mut changes = RoutingChangeSet::for_aggregate(agg);
            changes.delete_steps.push(step.id);
            changes.delete_dependencies = dependencies_removed.clone();
            Ok((
                changes,
                StepRemoval {
                    step,
                    dependencies_removed,
                },
            ))
        })
        .await?;

        tracing::info!(
            routing_id = %routing,
            step_id = %step_id,
            step_number = removal.step.step_number,
            dependencies_removed = removal.dependencies_removed.len(),
            "Step deleted"
        );
        Ok(removal)
    }

    /// Renumber every step of the routing to follow `ordered`.
    ///
    /// `ordered` must list each step of the routing exactly once. Numbers
    /// start at `resequence_start` and grow by `resequence_increment`. All
    /// steps are renumbered in one commit.
    pub async fn resequence_steps(
        &self,
        routing: &RoutingId,
        ordered: &[StepId],
    ) -> RoutingResult<Vec<RoutingStep>> {
        let numbers = self.config.resequence_numbers(ordered.len()).ok_or_else(|| {
            RoutingError::InvalidResequence {
                routing: *routing,
                reason: "step numbers would overflow".to_string(),
            }
        })?;

        let (_, steps) = mutate_routing(&*self.store, *routing, self.config.max_commit_retries, |agg| {
            ensure_structure_editable(agg)?;
            let invalid = |reason: String| RoutingError::InvalidResequence {
                routing: agg.routing.id,
                reason,
            };

            let mut listed = BTreeSet::new();
            for id in ordered {
                if !listed.insert(*id) {
                    return Err(invalid(format!("step {id} listed more than once")));
                }
                if agg.step(id).is_none() {
                    return Err(invalid(format!("step {id} does not belong to the routing")));
                }
            }
            if let Some(missing) = agg.steps.iter().find(|s| !listed.contains(&s.id)) {
                return Err(invalid(format!("step {} is missing from the ordering", missing.id)));
            }

            let now = Utc::now();
            let mut changes = RoutingChangeSet::for_aggregate(agg);
            let mut steps = Vec::with_capacity(ordered.len());
            for (id, number) in ordered.iter().zip(&numbers) {
                let Some(current) = agg.step(id) else { continue };
                let mut step = current.clone();
                if step.step_number != *number {
                    step.step_number = *number;
                    step.updated_at = now;
                    changes.upsert_steps.push(step.clone());
                }
                steps.push(step);
            }
            Ok((changes, steps))
        })
        .await?;

        tracing::info!(routing_id = %routing, steps = steps.len(), "Steps resequenced");
        Ok(steps)
    }

    /// Add a precedence edge between two steps of the same DRAFT routing.
    ///
    /// Rejected with `CircularDependency` if the successor already reaches
    /// the predecessor.
    pub async fn add_dependency(&self, input: NewDependency) -> RoutingResult<StepDependency> {
        if input.predecessor == input.successor {
            return Err(RoutingError::SelfDependency {
                step: input.predecessor,
            });
        }
        if input.constraint.kind.requires_value() && input.constraint.value.is_none() {
            return Err(RoutingError::MissingConstraintValue {
                kind: input.constraint.kind.to_string(),
            });
        }

        let predecessor_routing = self.owning_routing(&input.predecessor).await?;
        let successor_routing = self.owning_routing(&input.successor).await?;
        if predecessor_routing != successor_routing {
            tracing::warn!(
                predecessor = %input.predecessor,
                successor = %input.successor,
                "Cross-routing dependency rejected"
            );
            return Err(RoutingError::CrossRoutingDependency {
                predecessor: input.predecessor,
                successor: input.successor,
                predecessor_routing,
                successor_routing,
            });
        }

        let result = mutate_routing(
            &*self.store,
            predecessor_routing,
            self.config.max_commit_retries,
            |agg| {
                ensure_structure_editable(agg)?;
                DependencyGraph::from_aggregate(agg).check_edge(&input.predecessor, &input.successor)?;
                let dependency = StepDependency::new(
                    agg.routing.id,
                    input.predecessor,
                    input.successor,
                    input.dependency_type,
                    input.constraint,
                );
                let mut changes = RoutingChangeSet::for_aggregate(agg);
                changes.insert_dependencies.push(dependency.clone());
                Ok((changes, dependency))
            },
        )
        .await;

        match result {
            Ok((_, dependency)) => {
                tracing::info!(
                    routing_id = %dependency.routing_id,
                    dependency_id = %dependency.id,
                    predecessor = %dependency.predecessor,
                    successor = %dependency.successor,
                    dependency_type = %dependency.dependency_type,
                    "Dependency added"
                );
                Ok(dependency)
            }
            Err(err) => {
                if let RoutingError::CircularDependency { cycle, .. } = &err {
                    tracing::warn!(
                        routing_id = %predecessor_routing,
                        predecessor = %input.predecessor,
                        successor = %input.successor,
                        cycle_len = cycle.len(),
                        "Dependency rejected, would close a cycle"
                    );
                }
                Err(err)
            }
        }
    }

    /// Remove a precedence edge from a DRAFT routing.
    pub async fn remove_dependency(&self, dependency_id: &DependencyId) -> RoutingResult<StepDependency> {
        let routing = self
            .store
            .routing_of_dependency(dependency_id)
            .await?
            .ok_or(RoutingError::DependencyNotFound(*dependency_id))?;

        let (_, removed) = mutate_routing(&*self.store, routing, self.config.max_commit_retries, |agg| {
            ensure_structure_editable(agg)?;
            let dependency = agg
                .dependency(dependency_id)
                .cloned()
                .ok_or(RoutingError::DependencyNotFound(*dependency_id))?;
            let mut changes = RoutingChangeSet::for_aggregate(agg);
            changes.delete_dependencies.push(dependency.id);
            Ok((changes, dependency))
        })
        .await?;

        tracing::info!(
            routing_id = %routing,
            dependency_id = %dependency_id,
            "Dependency removed"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryRoutingStore, RoutingDraft};
    use crate::types::{
        ConstraintKind, LifecycleState, PartId, Routing, SiteId, TimingConstraint,
    };

    async fn setup(state: LifecycleState) -> (StepSequencer<InMemoryRoutingStore>, Arc<InMemoryRoutingStore>, RoutingId) {
        let store = Arc::new(InMemoryRoutingStore::new());
        let now = Utc::now();
        let routing = Routing {
            id: RoutingId::generate(),
            routing_number: String::new(),
            part: PartId::from("PN001"),
            site: SiteId::from("DAL"),
            version: "1.0".into(),
            state,
            description: None,
            is_primary_route: false,
            approval: None,
            review_notes: None,
            effective_from: None,
            effective_to: None,
            derived_from: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        let id = routing.id;
        store.insert_routing(RoutingDraft::empty(routing)).await.unwrap();
        (StepSequencer::new(Arc::clone(&store), EngineConfig::default()), store, id)
    }

    #[tokio::test]
    async fn test_add_step_rejects_duplicate_number() {
        let (seq, _, routing) = setup(LifecycleState::Draft).await;
        seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();
        let err = seq.add_step(&routing, NewStep::new(10, "seg-drill")).await.unwrap_err();
        assert_eq!(err, RoutingError::DuplicateStepNumber { routing, step_number: 10 });
    }

    #[tokio::test]
    async fn test_add_step_rejects_zero() {
        let (seq, _, routing) = setup(LifecycleState::Draft).await;
        let err = seq.add_step(&routing, NewStep::new(0, "seg-mill")).await.unwrap_err();
        assert_eq!(err, RoutingError::InvalidStepNumber { step_number: 0 });
    }

    #[tokio::test]
    async fn test_oversized_timing_override_rejected() {
        let (seq, store, routing) = setup(LifecycleState::Draft).await;
        let err = seq
            .add_step(
                &routing,
                NewStep::new(10, "seg-mill").with_timing(TimingOverride::full(u64::MAX, 1, 0)),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::InvalidTiming {
                component: "setup",
                secs: u64::MAX,
                max: MAX_TIMING_SECS,
            }
        );
        assert_eq!(store.num_steps(), 0);

        let step = seq
            .add_step(
                &routing,
                NewStep::new(10, "seg-mill").with_timing(TimingOverride::full(MAX_TIMING_SECS, 0, 0)),
            )
            .await
            .unwrap();
        let patch = StepPatch {
            timing: Some(TimingOverride {
                cycle_secs: Some(MAX_TIMING_SECS + 1),
                ..TimingOverride::default()
            }),
            ..StepPatch::default()
        };
        let err = seq.update_step(&step.id, patch).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidTiming { component: "cycle", .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_structure_locked_outside_draft() {
        let (seq, _, routing) = setup(LifecycleState::Review).await;
        let err = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::StructureLocked {
                routing,
                state: LifecycleState::Review
            }
        );
    }

    #[tokio::test]
    async fn test_update_step_number_collision() {
        let (seq, _, routing) = setup(LifecycleState::Draft).await;
        let a = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();
        seq.add_step(&routing, NewStep::new(20, "seg-drill")).await.unwrap();

        let collide = StepPatch {
            step_number: Some(20),
            ..StepPatch::default()
        };
        let err = seq.update_step(&a.id, collide).await.unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateStepNumber { step_number: 20, .. }));

        let move_to_gap = StepPatch {
            step_number: Some(15),
            description: Some(Some("rough mill".into())),
            ..StepPatch::default()
        };
        let updated = seq.update_step(&a.id, move_to_gap).await.unwrap();
        assert_eq!(updated.step_number, 15);
        assert_eq!(updated.description.as_deref(), Some("rough mill"));
    }

    #[tokio::test]
    async fn test_delete_step_cascades() {
        let (seq, store, routing) = setup(LifecycleState::Draft).await;
        let a = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();
        let b = seq.add_step(&routing, NewStep::new(20, "seg-drill")).await.unwrap();
        let c = seq.add_step(&routing, NewStep::new(30, "seg-deburr")).await.unwrap();
        seq.add_dependency(NewDependency::finish_to_start(a.id, b.id)).await.unwrap();
        seq.add_dependency(NewDependency::finish_to_start(b.id, c.id)).await.unwrap();

        let removal = seq.delete_step(&b.id).await.unwrap();
        assert_eq!(removal.dependencies_removed.len(), 2);

        let agg = store.load_aggregate(&routing).await.unwrap().unwrap();
        assert_eq!(agg.steps.len(), 2);
        assert!(agg.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_resequence_validates_ordering() {
        let (seq, _, routing) = setup(LifecycleState::Draft).await;
        let a = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();
        let b = seq.add_step(&routing, NewStep::new(20, "seg-drill")).await.unwrap();

        for bad in [vec![a.id], vec![a.id, a.id], vec![a.id, b.id, StepId::generate()]] {
            let err = seq.resequence_steps(&routing, &bad).await.unwrap_err();
            assert!(matches!(err, RoutingError::InvalidResequence { .. }), "{bad:?}");
        }

        let steps = seq.resequence_steps(&routing, &[b.id, a.id]).await.unwrap();
        assert_eq!(steps[0].id, b.id);
        assert_eq!(steps[0].step_number, 10);
        assert_eq!(steps[1].step_number, 20);
    }

    #[tokio::test]
    async fn test_dependency_rules() {
        let (seq, _, routing) = setup(LifecycleState::Draft).await;
        let a = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();
        let b = seq.add_step(&routing, NewStep::new(20, "seg-drill")).await.unwrap();

        let err = seq
            .add_dependency(NewDependency::finish_to_start(a.id, a.id))
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::SelfDependency { step: a.id });

        let pinned_without_value = NewDependency::finish_to_start(a.id, b.id).with_constraint(TimingConstraint {
            kind: ConstraintKind::MustStartOn,
            value: None,
        });
        let err = seq.add_dependency(pinned_without_value).await.unwrap_err();
        assert!(matches!(err, RoutingError::MissingConstraintValue { .. }));

        let edge = seq.add_dependency(NewDependency::finish_to_start(a.id, b.id)).await.unwrap();
        let err = seq
            .add_dependency(NewDependency::finish_to_start(a.id, b.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateDependency { .. }));

        let err = seq
            .add_dependency(NewDependency::finish_to_start(b.id, a.id))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::CircularDependency {
                predecessor: b.id,
                successor: a.id,
                cycle: vec![a.id, b.id],
            }
        );

        seq.remove_dependency(&edge.id).await.unwrap();
        seq.add_dependency(NewDependency::finish_to_start(b.id, a.id)).await.unwrap();
        let err = seq.remove_dependency(&edge.id).await.unwrap_err();
        assert_eq!(err, RoutingError::DependencyNotFound(edge.id));
    }

    #[tokio::test]
    async fn test_cross_routing_dependency_rejected() {
        let (seq, store, routing) = setup(LifecycleState::Draft).await;
        let a = seq.add_step(&routing, NewStep::new(10, "seg-mill")).await.unwrap();

        let now = Utc::now();
        let other = Routing {
            id: RoutingId::generate(),
            routing_number: String::new(),
            part: PartId::from("PN001"),
            site: SiteId::from("DAL"),
            version: "2.0".into(),
            state: LifecycleState::Draft,
            description: None,
            is_primary_route: false,
            approval: None,
            review_notes: None,
            effective_from: None,
            effective_to: None,
            derived_from: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        let other_id = other.id;
        store.insert_routing(RoutingDraft::empty(other)).await.unwrap();
        let b = seq.add_step(&other_id, NewStep::new(10, "seg-mill")).await.unwrap();

        let err = seq
            .add_dependency(NewDependency::finish_to_start(a.id, b.id))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::CrossRoutingDependency {
                predecessor: a.id,
                successor: b.id,
                predecessor_routing: routing,
                successor_routing: other_id,
            }
        );
    }
}
