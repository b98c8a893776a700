//! Canonical serialization and structure fingerprints.
//!
//! A structure fingerprint identifies *what* a routing does, independent of
//! row identities: steps are keyed by step number and edges are expressed as
//! step-number pairs. Two routings with the same steps, overrides, flags and
//! edges share a fingerprint, which makes copies and approvals comparable.
//!
//! ## Determinism Guarantees
//!
//! - Steps serialize in step-number order
//! - Edges serialize in (predecessor number, successor number) order
//! - No HashMap in hashed data

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use crate::types::{
    ConstraintKind, DependencyType, RoutingAggregate, StepFlags, StepId, TimingOverride,
};

/// Version of the fingerprint layout. Bump when the hashed shape changes.
pub const FINGERPRINT_VERSION: &str = "routing-structure/1";

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain structs of strings, integers and enums cannot fail to serialize.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), 0)
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

#[derive(Serialize)]
struct CanonicalStep<'a> {
    number: u32,
    segment: &'a str,
    flags: StepFlags,
    timing: TimingOverride,
}

#[derive(Serialize)]
struct CanonicalEdge {
    from: u32,
    to: u32,
    kind: DependencyType,
    constraint: ConstraintKind,
    constraint_value: Option<i64>,
}

#[derive(Serialize)]
struct CanonicalStructure<'a> {
    layout: &'static str,
    steps: Vec<CanonicalStep<'a>>,
    edges: Vec<CanonicalEdge>,
}

/// Fingerprint of a routing's steps and dependency edges.
///
/// Edges whose endpoints are not among the aggregate's steps are ignored.
pub fn structure_fingerprint(aggregate: &RoutingAggregate) -> String {
    let mut steps: Vec<CanonicalStep<'_>> = aggregate
        .steps
        .iter()
        .map(|s| CanonicalStep {
            number: s.step_number,
            segment: s.process_segment.as_str(),
            flags: s.flags,
            timing: s.timing,
        })
        .collect();
    steps.sort_by_key(|s| s.number);

    let number_of = |id: &StepId| aggregate.step(id).map(|s| s.step_number);
    let mut edges: Vec<CanonicalEdge> = aggregate
        .dependencies
        .iter()
        .filter_map(|d| {
            Some(CanonicalEdge {
                from: number_of(&d.predecessor)?,
                to: number_of(&d.successor)?,
                kind: d.dependency_type,
                constraint: d.constraint.kind,
                constraint_value: d.constraint.value.map(|v| v.timestamp()),
            })
        })
        .collect();
    edges.sort_by_key(|e| (e.from, e.to));

    canonical_hash_hex(&CanonicalStructure {
        layout: FINGERPRINT_VERSION,
        steps,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        LifecycleState, PartId, ProcessSegmentId, Routing, RoutingId, RoutingStep, SiteId,
        StepDependency, TimingConstraint,
    };
    use chrono::Utc;

    fn routing() -> Routing {
        let now = Utc::now();
        Routing {
            id: RoutingId::generate(),
            routing_number: "RTG-DAL-PN001-001".into(),
            part: PartId::from("PN001"),
            site: SiteId::from("DAL"),
            version: "1.0".into(),
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

    fn step(routing: RoutingId, number: u32, segment: &str) -> RoutingStep {
        let now = Utc::now();
        RoutingStep {
            id: StepId::generate(),
            routing_id: routing,
            step_number: number,
            process_segment: ProcessSegmentId::from(segment),
            flags: StepFlags::default(),
            timing: TimingOverride::default(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn aggregate() -> RoutingAggregate {
        let r = routing();
        let a = step(r.id, 10, "seg-mill");
        let b = step(r.id, 20, "seg-drill");
        let edge = StepDependency::new(
            r.id,
            a.id,
            b.id,
            DependencyType::FinishToStart,
            TimingConstraint::asap(),
        );
        RoutingAggregate {
            routing: r,
            steps: vec![a, b],
            dependencies: vec![edge],
        }
    }

    #[test]
    fn test_fingerprint_ignores_row_ids() {
        let one = aggregate();
        let two = aggregate();
        assert_ne!(one.routing.id, two.routing.id);
        assert_eq!(structure_fingerprint(&one), structure_fingerprint(&two));
    }

    #[test]
    fn test_fingerprint_sees_structure_changes() {
        let base = aggregate();
        let mut renumbered = base.clone();
        renumbered.steps[1].step_number = 30;
        let mut unlinked = base.clone();
        unlinked.dependencies.clear();

        let fp = structure_fingerprint(&base);
        assert_ne!(fp, structure_fingerprint(&renumbered));
        assert_ne!(fp, structure_fingerprint(&unlinked));
    }
}
