//! In-memory routing store.
//!
//! All tables live behind a single `parking_lot::RwLock`. Every trait method
//! holds the lock for its whole check-then-write, which makes each call a
//! serialisable transaction: writers exclude each other and readers only see
//! fully applied commits. Uses BTreeMap for deterministic iteration order.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::identifiers::RoutingNumberFormat;
use crate::types::{
    AvailabilityId, DependencyId, PartId, PartSiteAvailability, Routing, RoutingAggregate,
    RoutingId, RoutingStep, SiteId, StepDependency, StepId,
};
use super::{RoutingChangeSet, RoutingDraft, RoutingStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    routings: BTreeMap<RoutingId, Routing>,
    steps: BTreeMap<StepId, RoutingStep>,
    dependencies: BTreeMap<DependencyId, StepDependency>,
    availability: BTreeMap<AvailabilityId, PartSiteAvailability>,
}

impl Tables {
    fn steps_of(&self, routing: &RoutingId) -> impl Iterator<Item = &RoutingStep> {
        let routing = *routing;
        self.steps.values().filter(move |s| s.routing_id == routing)
    }

    fn dependencies_of(&self, routing: &RoutingId) -> impl Iterator<Item = &StepDependency> {
        let routing = *routing;
        self.dependencies.values().filter(move |d| d.routing_id == routing)
    }

    fn aggregate(&self, id: &RoutingId) -> Option<RoutingAggregate> {
        let routing = self.routings.get(id)?.clone();
        let mut steps: Vec<RoutingStep> = self.steps_of(id).cloned().collect();
        steps.sort_by_key(|s| s.step_number);
        let mut dependencies: Vec<StepDependency> = self.dependencies_of(id).cloned().collect();
        dependencies.sort();
        Some(RoutingAggregate {
            routing,
            steps,
            dependencies,
        })
    }

    fn version_taken(&self, part: &PartId, site: &SiteId, version: &str, except: Option<RoutingId>) -> bool {
        self.routings.values().any(|r| {
            Some(r.id) != except && &r.part == part && &r.site == site && r.version == version
        })
    }
}

/// Reject duplicate step numbers and dangling edges in a prospective step set.
fn check_contents(
    routing: RoutingId,
    steps: &BTreeMap<StepId, u32>,
    dependencies: &[(StepId, StepId)],
) -> Result<(), StoreError> {
    let mut seen = BTreeSet::new();
    for number in steps.values() {
        if !seen.insert(*number) {
            return Err(StoreError::DuplicateStepNumber {
                routing,
                step_number: *number,
            });
        }
    }
    for (pred, succ) in dependencies {
        if !steps.contains_key(pred) || !steps.contains_key(succ) {
            return Err(StoreError::Backend(format!(
                "dependency {pred} -> {succ} references a step outside routing {routing}"
            )));
        }
    }
    Ok(())
}

/// In-memory routing store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryRoutingStore {
    tables: RwLock<Tables>,
    numbering: RoutingNumberFormat,
}

impl InMemoryRoutingStore {
    /// Create a new empty store with the default routing-number layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a custom routing-number layout.
    pub fn with_numbering(numbering: RoutingNumberFormat) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            numbering,
        }
    }

    /// Number of routings.
    pub fn num_routings(&self) -> usize {
        self.tables.read().routings.len()
    }

    /// Number of steps across all routings.
    pub fn num_steps(&self) -> usize {
        self.tables.read().steps.len()
    }

    /// Number of dependency edges across all routings.
    pub fn num_dependencies(&self) -> usize {
        self.tables.read().dependencies.len()
    }
}

#[async_trait]
impl RoutingStore for InMemoryRoutingStore {
    async fn insert_routing(&self, draft: RoutingDraft) -> Result<Routing, StoreError> {
        let mut tables = self.tables.write();
        let RoutingDraft {
            mut routing,
            steps,
            dependencies,
        } = draft;

        if tables.version_taken(&routing.part, &routing.site, &routing.version, None) {
            return Err(StoreError::DuplicateRoutingVersion {
                part: routing.part.clone(),
                site: routing.site.clone(),
                version: routing.version.clone(),
            });
        }

        let step_numbers: BTreeMap<StepId, u32> =
            steps.iter().map(|s| (s.id, s.step_number)).collect();
        let edges: Vec<(StepId, StepId)> = dependencies
            .iter()
            .map(|d| (d.predecessor, d.successor))
            .collect();
        check_contents(routing.id, &step_numbers, &edges)?;

        routing.routing_number = self.numbering.next_number(
            &routing.site,
            &routing.part,
            tables
                .routings
                .values()
                .filter(|r| r.site == routing.site && r.part == routing.part)
                .map(|r| r.routing_number.as_str()),
        );
        if tables
            .routings
            .values()
            .any(|r| r.routing_number == routing.routing_number)
        {
            return Err(StoreError::DuplicateRoutingNumber(routing.routing_number));
        }

        for mut step in steps {
            step.routing_id = routing.id;
            tables.steps.insert(step.id, step);
        }
        for mut dep in dependencies {
            dep.routing_id = routing.id;
            tables.dependencies.insert(dep.id, dep);
        }
        tables.routings.insert(routing.id, routing.clone());
        Ok(routing)
    }

    async fn get_routing(&self, id: &RoutingId) -> Result<Option<Routing>, StoreError> {
        Ok(self.tables.read().routings.get(id).cloned())
    }

    async fn load_aggregate(&self, id: &RoutingId) -> Result<Option<RoutingAggregate>, StoreError> {
        Ok(self.tables.read().aggregate(id))
    }

    async fn routing_of_step(&self, step: &StepId) -> Result<Option<RoutingId>, StoreError> {
        Ok(self.tables.read().steps.get(step).map(|s| s.routing_id))
    }

    async fn routing_of_dependency(
        &self,
        dependency: &DependencyId,
    ) -> Result<Option<RoutingId>, StoreError> {
        Ok(self
            .tables
            .read()
            .dependencies
            .get(dependency)
            .map(|d| d.routing_id))
    }

    async fn list_routings(&self, part: &PartId, site: &SiteId) -> Result<Vec<Routing>, StoreError> {
        let tables = self.tables.read();
        let mut routings: Vec<Routing> = tables
            .routings
            .values()
            .filter(|r| &r.part == part && &r.site == site)
            .cloned()
            .collect();
        routings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(routings)
    }

    async fn commit(&self, changes: RoutingChangeSet) -> Result<Routing, StoreError> {
        let mut tables = self.tables.write();
        let routing_id = changes.routing_id;

        let current = tables
            .routings
            .get(&routing_id)
            .cloned()
            .ok_or(StoreError::RoutingNotFound(routing_id))?;
        if current.revision != changes.expected_revision {
            return Err(StoreError::RevisionConflict {
                routing: routing_id,
                expected: changes.expected_revision,
                actual: current.revision,
            });
        }

        // Validate the final state before touching any table.
        let deleted_steps: BTreeSet<StepId> = changes.delete_steps.iter().copied().collect();
        let mut final_steps: BTreeMap<StepId, u32> = tables
            .steps_of(&routing_id)
            .filter(|s| !deleted_steps.contains(&s.id))
            .map(|s| (s.id, s.step_number))
            .collect();
        for step in &changes.upsert_steps {
            if step.routing_id != routing_id {
                return Err(StoreError::Backend(format!(
                    "step {} belongs to routing {}, not {}",
                    step.id, step.routing_id, routing_id
                )));
            }
            if let Some(existing) = tables.steps.get(&step.id) {
                if existing.routing_id != routing_id {
                    return Err(StoreError::Backend(format!(
                        "step {} already belongs to routing {}",
                        step.id, existing.routing_id
                    )));
                }
            }
            final_steps.insert(step.id, step.step_number);
        }

        let deleted_deps: BTreeSet<DependencyId> =
            changes.delete_dependencies.iter().copied().collect();
        let final_edges: Vec<(StepId, StepId)> = tables
            .dependencies_of(&routing_id)
            .filter(|d| !deleted_deps.contains(&d.id))
            .filter(|d| !deleted_steps.contains(&d.predecessor) && !deleted_steps.contains(&d.successor))
            .map(|d| (d.predecessor, d.successor))
            .chain(
                changes
                    .insert_dependencies
                    .iter()
                    .map(|d| (d.predecessor, d.successor)),
            )
            .collect();
        check_contents(routing_id, &final_steps, &final_edges)?;

        let mut updated = changes.routing.unwrap_or_else(|| current.clone());
        if updated.id != routing_id {
            return Err(StoreError::Backend(format!(
                "change set for {} carries routing row {}",
                routing_id, updated.id
            )));
        }
        if updated.version != current.version
            && tables.version_taken(&updated.part, &updated.site, &updated.version, Some(routing_id))
        {
            return Err(StoreError::DuplicateRoutingVersion {
                part: updated.part.clone(),
                site: updated.site.clone(),
                version: updated.version.clone(),
            });
        }

        // Apply.
        let now = Utc::now();
        tables.dependencies.retain(|id, d| {
            !(d.routing_id == routing_id
                && (deleted_deps.contains(id)
                    || deleted_steps.contains(&d.predecessor)
                    || deleted_steps.contains(&d.successor)))
        });
        for id in &deleted_steps {
            tables.steps.remove(id);
        }
        for step in changes.upsert_steps {
            tables.steps.insert(step.id, step);
        }
        for dep in changes.insert_dependencies {
            tables.dependencies.insert(dep.id, dep);
        }

        if changes.demote_other_primaries {
            for other in tables.routings.values_mut() {
                if other.id != routing_id
                    && other.part == updated.part
                    && other.site == updated.site
                    && other.is_primary_route
                {
                    other.is_primary_route = false;
                    other.revision += 1;
                    other.updated_at = now;
                }
            }
        }

        updated.revision = current.revision + 1;
        updated.updated_at = now;
        tables.routings.insert(routing_id, updated.clone());
        Ok(updated)
    }

    async fn delete_routing(&self, id: &RoutingId, expected_revision: u64) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let current = tables
            .routings
            .get(id)
            .ok_or(StoreError::RoutingNotFound(*id))?;
        if current.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                routing: *id,
                expected: expected_revision,
                actual: current.revision,
            });
        }
        tables.routings.remove(id);
        tables.steps.retain(|_, s| &s.routing_id != id);
        tables.dependencies.retain(|_, d| &d.routing_id != id);
        Ok(())
    }

    async fn insert_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError> {
        let mut tables = self.tables.write();
        if tables
            .availability
            .values()
            .any(|a| a.part == record.part && a.site == record.site)
        {
            return Err(StoreError::DuplicateAvailability {
                part: record.part,
                site: record.site,
            });
        }
        tables.availability.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_availability(
        &self,
        part: &PartId,
        site: &SiteId,
    ) -> Result<Option<PartSiteAvailability>, StoreError> {
        Ok(self
            .tables
            .read()
            .availability
            .values()
            .find(|a| &a.part == part && &a.site == site)
            .cloned())
    }

    async fn get_availability_by_id(
        &self,
        id: &AvailabilityId,
    ) -> Result<Option<PartSiteAvailability>, StoreError> {
        Ok(self.tables.read().availability.get(id).cloned())
    }

    async fn list_availability_for_part(
        &self,
        part: &PartId,
    ) -> Result<Vec<PartSiteAvailability>, StoreError> {
        let tables = self.tables.read();
        let mut records: Vec<PartSiteAvailability> = tables
            .availability
            .values()
            .filter(|a| &a.part == part)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.preference_rank
                .cmp(&b.preference_rank)
                .then_with(|| a.site.cmp(&b.site))
        });
        Ok(records)
    }

    async fn update_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError> {
        let mut tables = self.tables.write();
        let existing = tables
            .availability
            .get(&record.id)
            .ok_or(StoreError::AvailabilityNotFound(record.id))?;
        if existing.part != record.part || existing.site != record.site {
            let clash = tables
                .availability
                .values()
                .any(|a| a.id != record.id && a.part == record.part && a.site == record.site);
            if clash {
                return Err(StoreError::DuplicateAvailability {
                    part: record.part,
                    site: record.site,
                });
            }
        }
        tables.availability.insert(record.id, record.clone());
        Ok(record)
    }

    async fn delete_availability(&self, id: &AvailabilityId) -> Result<(), StoreError> {
        self.tables
            .write()
            .availability
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::AvailabilityNotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DependencyType, LifecycleState, ProcessSegmentId, StepFlags, TimingConstraint,
        TimingOverride,
    };

    fn routing(part: &str, site: &str, version: &str) -> Routing {
        let now = Utc::now();
        Routing {
            id: RoutingId::generate(),
            routing_number: String::new(),
            part: PartId::from(part),
            site: SiteId::from(site),
            version: version.to_string(),
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
        }
    }

    fn step(routing: RoutingId, number: u32) -> RoutingStep {
        let now = Utc::now();
        RoutingStep {
            id: StepId::generate(),
            routing_id: routing,
            step_number: number,
            process_segment: ProcessSegmentId::from("seg"),
            flags: StepFlags::default(),
            timing: TimingOverride::default(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn edge(routing: RoutingId, a: StepId, b: StepId) -> StepDependency {
        StepDependency::new(routing, a, b, DependencyType::FinishToStart, TimingConstraint::asap())
    }

    fn availability(part: &str, site: &str, rank: i32) -> PartSiteAvailability {
        let now = Utc::now();
        PartSiteAvailability {
            id: AvailabilityId::generate(),
            part: PartId::from(part),
            site: SiteId::from(site),
            preference_rank: rank,
            is_active: true,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_numbers() {
        let store = InMemoryRoutingStore::new();
        let a = store
            .insert_routing(RoutingDraft::empty(routing("PN001", "DAL", "1.0")))
            .await
            .unwrap();
        let b = store
            .insert_routing(RoutingDraft::empty(routing("PN001", "DAL", "1.1")))
            .await
            .unwrap();
        let c = store
            .insert_routing(RoutingDraft::empty(routing("PN001", "HOU", "1.0")))
            .await
            .unwrap();
        assert_eq!(a.routing_number, "RTG-DAL-PN001-001");
        assert_eq!(b.routing_number, "RTG-DAL-PN001-002");
        assert_eq!(c.routing_number, "RTG-HOU-PN001-001");
    }

    #[tokio::test]
    async fn test_colliding_numbers_across_pairs_rejected() {
        let store = InMemoryRoutingStore::new();
        let dashed_part = store
            .insert_routing(RoutingDraft::empty(routing("A-1", "DAL", "1.0")))
            .await
            .unwrap();
        let plain_part = store
            .insert_routing(RoutingDraft::empty(routing("A", "DAL", "1.0")))
            .await
            .unwrap();
        assert_eq!(dashed_part.routing_number, "RTG-DAL-A-1-001");
        assert_eq!(plain_part.routing_number, "RTG-DAL-A-001");

        // Only reachable when the site check is bypassed.
        let err = store
            .insert_routing(RoutingDraft::empty(routing("1", "DAL-A", "1.0")))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateRoutingNumber("RTG-DAL-A-1-001".to_string())
        );
        assert_eq!(store.num_routings(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = InMemoryRoutingStore::new();
        store
            .insert_routing(RoutingDraft::empty(routing("PN001", "DAL", "1.0")))
            .await
            .unwrap();
        let err = store
            .insert_routing(RoutingDraft::empty(routing("PN001", "DAL", "1.0")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRoutingVersion { .. }));
        assert_eq!(store.num_routings(), 1);
    }

    #[tokio::test]
    async fn test_commit_swaps_step_numbers() {
        let store = InMemoryRoutingStore::new();
        let r = routing("PN001", "DAL", "1.0");
        let a = step(r.id, 10);
        let b = step(r.id, 20);
        let draft = RoutingDraft {
            routing: r.clone(),
            steps: vec![a.clone(), b.clone()],
            dependencies: vec![],
        };
        store.insert_routing(draft).await.unwrap();

        let mut changes = RoutingChangeSet::new(r.id, 0);
        let mut a2 = a.clone();
        a2.step_number = 20;
        let mut b2 = b.clone();
        b2.step_number = 10;
        changes.upsert_steps = vec![a2, b2];
        let updated = store.commit(changes).await.unwrap();
        assert_eq!(updated.revision, 1);

        let agg = store.load_aggregate(&r.id).await.unwrap().unwrap();
        assert_eq!(agg.steps[0].id, b.id);
        assert_eq!(agg.steps[1].id, a.id);
    }

    #[tokio::test]
    async fn test_failed_commit_changes_nothing() {
        let store = InMemoryRoutingStore::new();
        let r = routing("PN001", "DAL", "1.0");
        let a = step(r.id, 10);
        let b = step(r.id, 20);
        store
            .insert_routing(RoutingDraft {
                routing: r.clone(),
                steps: vec![a.clone(), b.clone()],
                dependencies: vec![],
            })
            .await
            .unwrap();
        let before = store.load_aggregate(&r.id).await.unwrap().unwrap();

        let mut changes = RoutingChangeSet::new(r.id, 0);
        let mut a2 = a.clone();
        a2.step_number = 20;
        changes.upsert_steps = vec![a2];
        changes.insert_dependencies = vec![edge(r.id, a.id, b.id)];
        let err = store.commit(changes).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStepNumber { step_number: 20, .. }));

        let after = store.load_aggregate(&r.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_stale_revision_rejected() {
        let store = InMemoryRoutingStore::new();
        let r = routing("PN001", "DAL", "1.0");
        store.insert_routing(RoutingDraft::empty(r.clone())).await.unwrap();
        store.commit(RoutingChangeSet::new(r.id, 0)).await.unwrap();
        let err = store.commit(RoutingChangeSet::new(r.id, 0)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::RevisionConflict {
                routing: r.id,
                expected: 0,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn test_step_delete_cascades_edges() {
        let store = InMemoryRoutingStore::new();
        let r = routing("PN001", "DAL", "1.0");
        let a = step(r.id, 10);
        let b = step(r.id, 20);
        let c = step(r.id, 30);
        store
            .insert_routing(RoutingDraft {
                routing: r.clone(),
                steps: vec![a.clone(), b.clone(), c.clone()],
                dependencies: vec![edge(r.id, a.id, b.id), edge(r.id, b.id, c.id)],
            })
            .await
            .unwrap();

        let mut changes = RoutingChangeSet::new(r.id, 0);
        changes.delete_steps = vec![b.id];
        store.commit(changes).await.unwrap();

        assert_eq!(store.num_steps(), 2);
        assert_eq!(store.num_dependencies(), 0);
    }

    #[tokio::test]
    async fn test_delete_routing_removes_contents() {
        let store = InMemoryRoutingStore::new();
        let r = routing("PN001", "DAL", "1.0");
        let a = step(r.id, 10);
        let b = step(r.id, 20);
        store
            .insert_routing(RoutingDraft {
                routing: r.clone(),
                steps: vec![a.clone(), b.clone()],
                dependencies: vec![edge(r.id, a.id, b.id)],
            })
            .await
            .unwrap();
        store.delete_routing(&r.id, 0).await.unwrap();
        assert_eq!(store.num_routings(), 0);
        assert_eq!(store.num_steps(), 0);
        assert_eq!(store.num_dependencies(), 0);
    }

    #[tokio::test]
    async fn test_demote_other_primaries() {
        let store = InMemoryRoutingStore::new();
        let mut old = routing("PN001", "DAL", "1.0");
        old.is_primary_route = true;
        old.state = LifecycleState::Production;
        store.insert_routing(RoutingDraft::empty(old.clone())).await.unwrap();
        let mut new = routing("PN001", "DAL", "1.1");
        new.state = LifecycleState::Production;
        store.insert_routing(RoutingDraft::empty(new.clone())).await.unwrap();

        let mut promoted = new.clone();
        promoted.is_primary_route = true;
        let mut changes = RoutingChangeSet::new(new.id, 0).with_routing(promoted);
        changes.demote_other_primaries = true;
        store.commit(changes).await.unwrap();

        let old_after = store.get_routing(&old.id).await.unwrap().unwrap();
        assert!(!old_after.is_primary_route);
        assert_eq!(old_after.revision, 1);
        assert!(store.get_routing(&new.id).await.unwrap().unwrap().is_primary_route);
    }

    #[tokio::test]
    async fn test_availability_unique_and_ranked() {
        let store = InMemoryRoutingStore::new();
        store.insert_availability(availability("PN001", "HOU", 2)).await.unwrap();
        store.insert_availability(availability("PN001", "DAL", 1)).await.unwrap();
        store.insert_availability(availability("PN002", "DAL", 0)).await.unwrap();
        let err = store
            .insert_availability(availability("PN001", "DAL", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAvailability { .. }));

        let sites: Vec<String> = store
            .list_availability_for_part(&PartId::from("PN001"))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.site.to_string())
            .collect();
        assert_eq!(sites, vec!["DAL", "HOU"]);
    }
}
