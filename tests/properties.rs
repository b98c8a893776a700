//! Property tests for graph, lifecycle and sequencing invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;
use routing_engine::{
    compare_versions, increment_version, CopyOptions, DependencyGraph, DependencyType,
    EngineConfig, InMemoryRoutingEngine, LifecycleAction, LifecycleState, NewDependency,
    NewRouting, NewStep, RoutingError, SegmentTiming, StepId,
};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn make_step(id: u128) -> StepId {
    StepId::new(Uuid::from_u128(id))
}

fn make_graph(n: usize) -> (DependencyGraph, Vec<StepId>) {
    let mut graph = DependencyGraph::new();
    let steps: Vec<StepId> = (1..=n as u128).map(make_step).collect();
    for step in &steps {
        graph.add_step(*step);
    }
    (graph, steps)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn make_engine() -> InMemoryRoutingEngine {
    let (engine, _, catalog) = InMemoryRoutingEngine::in_memory(EngineConfig::default());
    catalog.set_segment("seg-mill", SegmentTiming::new(600, 1800, 300));
    catalog.set_segment("seg-drill", SegmentTiming::new(300, 900, 120));
    engine
}

fn action_strategy() -> impl Strategy<Value = LifecycleAction> {
    prop_oneof![
        Just(LifecycleAction::Submit),
        Just(LifecycleAction::Approve {
            approved_by: "qa.lead".into(),
            notes: None,
        }),
        Just(LifecycleAction::Reject { notes: None }),
        Just(LifecycleAction::Activate),
        Just(LifecycleAction::Obsolete),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Dependency graph
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_accepted_edges_keep_graph_acyclic(
        n in 2usize..12,
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
    ) {
        let (mut graph, steps) = make_graph(n);

        for (a, b) in edges {
            let (p, s) = (steps[a % n], steps[b % n]);
            let had_path_back = graph.path_between(&s, &p).is_some();
            match graph.add_edge(p, s, DependencyType::FinishToStart) {
                Ok(()) => prop_assert!(!had_path_back),
                Err(RoutingError::CircularDependency { cycle, .. }) => {
                    prop_assert!(had_path_back);
                    prop_assert_eq!(cycle.first(), Some(&s));
                    prop_assert_eq!(cycle.last(), Some(&p));
                }
                Err(RoutingError::SelfDependency { .. }) => prop_assert_eq!(p, s),
                Err(RoutingError::DuplicateDependency { .. }) => prop_assert!(graph.has_edge(&p, &s)),
                Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
            }
            prop_assert!(graph.is_acyclic());
        }
    }

    #[test]
    fn prop_critical_path_is_bounded_by_steps(
        n in 1usize..10,
        durations in prop::collection::vec((0u64..600, 1u64..3600, 0u64..300), 10),
        edges in prop::collection::vec((0usize..10, 0usize..10), 0..20),
    ) {
        let (mut graph, steps) = make_graph(n);
        for (a, b) in edges {
            let _ = graph.add_edge(steps[a % n], steps[b % n], DependencyType::FinishToStart);
        }
        let timings: BTreeMap<StepId, SegmentTiming> = steps
            .iter()
            .zip(&durations)
            .map(|(id, (s, c, t))| (*id, SegmentTiming::new(*s, *c, *t)))
            .collect();

        let pass = graph.forward_pass(&timings).unwrap();
        let longest = timings.values().map(SegmentTiming::total).max().unwrap_or(0);
        let sum: u64 = timings.values().map(SegmentTiming::total).sum();

        prop_assert!(pass.critical_path_secs >= longest);
        prop_assert!(pass.critical_path_secs <= sum);
        prop_assert!(!pass.critical_path.is_empty());
        prop_assert_eq!(graph.forward_pass(&timings).unwrap(), pass);
    }

    #[test]
    fn prop_large_timings_never_panic(
        n in 1usize..6,
        durations in prop::collection::vec((any::<u64>(), any::<u64>(), any::<u64>()), 6),
        chained in any::<bool>(),
    ) {
        let (mut graph, steps) = make_graph(n);
        if chained {
            for pair in steps.windows(2) {
                graph.add_edge(pair[0], pair[1], DependencyType::FinishToStart).unwrap();
            }
        }
        let timings: BTreeMap<StepId, SegmentTiming> = steps
            .iter()
            .zip(&durations)
            .map(|(id, (s, c, t))| (*id, SegmentTiming::new(*s, *c, *t)))
            .collect();

        match graph.forward_pass(&timings) {
            Ok(pass) => {
                let longest = timings.values().filter_map(SegmentTiming::checked_total).max();
                prop_assert!(Some(pass.critical_path_secs) >= longest);
            }
            Err(RoutingError::TimingOverflow { step }) => prop_assert!(timings.contains_key(&step)),
            Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }

    #[test]
    fn prop_chain_critical_path_is_sum(
        durations in prop::collection::vec((0u64..600, 1u64..3600, 0u64..300), 1..10),
    ) {
        let (mut graph, steps) = make_graph(durations.len());
        for pair in steps.windows(2) {
            graph.add_edge(pair[0], pair[1], DependencyType::FinishToStart).unwrap();
        }
        let timings: BTreeMap<StepId, SegmentTiming> = steps
            .iter()
            .zip(&durations)
            .map(|(id, (s, c, t))| (*id, SegmentTiming::new(*s, *c, *t)))
            .collect();

        let pass = graph.forward_pass(&timings).unwrap();
        prop_assert_eq!(pass.critical_path_secs, timings.values().map(SegmentTiming::total).sum::<u64>());
        prop_assert_eq!(pass.critical_path, steps);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Versions
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_increment_always_sorts_after(major in 0u64..1000, minor in 0u64..1000, patch in proptest::option::of(0u64..100)) {
        let version = match patch {
            Some(p) => format!("{major}.{minor}.{p}"),
            None => format!("{major}.{minor}"),
        };
        let next = increment_version(&version).unwrap();
        prop_assert_eq!(compare_versions(&next, &version), std::cmp::Ordering::Greater);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_lifecycle_only_moves_along_allowed_edges(
        actions in prop::collection::vec(action_strategy(), 1..12),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let engine = make_engine();
            let routing = engine
                .lifecycle()
                .create_routing(NewRouting::new("PN001", "DAL"))
                .await
                .unwrap();

            let mut state = routing.state;
            let mut reached_release = false;
            for action in actions {
                let target = action.target();
                match engine.lifecycle().transition(&routing.id, action).await {
                    Ok(updated) => {
                        prop_assert!(state.can_transition_to(target));
                        prop_assert_eq!(updated.state, target);
                        state = updated.state;
                    }
                    Err(RoutingError::InvalidLifecycleTransition { from, to, .. }) => {
                        prop_assert!(!state.can_transition_to(target));
                        prop_assert_eq!(from, state);
                        prop_assert_eq!(to, target);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
                }
                if state >= LifecycleState::Released {
                    reached_release = true;
                }
                if reached_release {
                    prop_assert!(state >= LifecycleState::Released);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_resequence_assigns_numbers_in_requested_order(
        numbers in prop::collection::btree_set(1u32..500, 1..8),
        seed in any::<u64>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let engine = make_engine();
            let routing = engine
                .lifecycle()
                .create_routing(NewRouting::new("PN001", "DAL"))
                .await
                .unwrap();
            let mut ids = Vec::new();
            for number in &numbers {
                let step = engine
                    .sequencer()
                    .add_step(&routing.id, NewStep::new(*number, "seg-mill"))
                    .await
                    .unwrap();
                ids.push(step.id);
            }
            let len = ids.len();
            ids.rotate_left((seed as usize) % len);
            if seed % 2 == 0 {
                ids.reverse();
            }

            engine.sequencer().resequence_steps(&routing.id, &ids).await.unwrap();

            let agg = engine.get_aggregate(&routing.id).await.unwrap();
            for (i, id) in ids.iter().enumerate() {
                prop_assert_eq!(agg.step(id).unwrap().step_number, 10 * (i as u32 + 1));
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_copy_preserves_structure_and_timing(
        len in 1usize..8,
        edges in prop::collection::vec((0usize..8, 0usize..8), 0..12),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let engine = make_engine();
            let routing = engine
                .lifecycle()
                .create_routing(NewRouting::new("PN001", "DAL"))
                .await
                .unwrap();
            let mut ids = Vec::new();
            for i in 0..len {
                let segment = if i % 2 == 0 { "seg-mill" } else { "seg-drill" };
                let step = engine
                    .sequencer()
                    .add_step(&routing.id, NewStep::new(10 * (i as u32 + 1), segment))
                    .await
                    .unwrap();
                ids.push(step.id);
            }
            for (a, b) in edges {
                let _ = engine
                    .sequencer()
                    .add_dependency(NewDependency::finish_to_start(ids[a % len], ids[b % len]))
                    .await;
            }

            let outcome = engine
                .composer()
                .copy_routing(&routing.id, CopyOptions::default().to_site("HOU"))
                .await
                .unwrap();
            let source = engine.get_aggregate(&routing.id).await.unwrap();

            prop_assert_eq!(outcome.steps_copied, source.steps.len());
            prop_assert_eq!(outcome.dependencies_copied, source.dependencies.len());
            prop_assert_eq!(&outcome.source_fingerprint, &outcome.copy_fingerprint);

            let source_timing = engine.composer().compute_timing(&routing.id).await.unwrap();
            let copy_timing = engine.composer().compute_timing(&outcome.routing.id).await.unwrap();
            prop_assert_eq!(source_timing.critical_path_secs, copy_timing.critical_path_secs);
            prop_assert_eq!(source_timing.total_secs, copy_timing.total_secs);
            Ok(())
        })?;
    }
}
