//! Read-validate-commit loop shared by the engine components.
//!
//! A mutation loads the routing aggregate, plans a [`RoutingChangeSet`]
//! against it and commits with the revision it read. If another writer
//! committed in between, the store reports a revision conflict and the
//! mutation is planned again from a fresh aggregate, so every validation
//! runs against the state the change is applied to.

use crate::error::{RoutingError, RoutingResult};
use crate::store::{RoutingChangeSet, RoutingStore, StoreError};
use crate::types::{Routing, RoutingAggregate, RoutingId};

/// Run `plan` against the current aggregate and commit its change set.
///
/// `plan` may run several times. Business-rule errors it returns are final;
/// only revision conflicts are retried, at most `max_retries` times.
pub(crate) async fn mutate_routing<S, T, F>(
    store: &S,
    routing: RoutingId,
    max_retries: u32,
    mut plan: F,
) -> RoutingResult<(Routing, T)>
where
    S: RoutingStore + ?Sized,
    F: FnMut(&RoutingAggregate) -> RoutingResult<(RoutingChangeSet, T)>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let aggregate = store
            .load_aggregate(&routing)
            .await?
            .ok_or(RoutingError::RoutingNotFound(routing))?;
        let (changes, output) = plan(&aggregate)?;

        match store.commit(changes).await {
            Ok(committed) => return Ok((committed, output)),
            Err(StoreError::RevisionConflict { expected, actual, .. }) if attempts <= max_retries => {
                tracing::debug!(
                    routing_id = %routing,
                    expected,
                    actual,
                    attempt = attempts,
                    "Revision conflict, replanning"
                );
            }
            Err(StoreError::RevisionConflict { .. }) => {
                return Err(RoutingError::ConcurrentModification { routing, attempts });
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryRoutingStore, RoutingDraft};
    use crate::types::{LifecycleState, PartId, SiteId};
    use chrono::Utc;

    fn routing() -> Routing {
        let now = Utc::now();
        Routing {
            id: RoutingId::generate(),
            routing_number: String::new(),
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

    #[tokio::test]
    async fn test_replans_after_conflict() {
        let store = InMemoryRoutingStore::new();
        let r = store.insert_routing(RoutingDraft::empty(routing())).await.unwrap();

        let mut calls = 0;
        let (committed, seen) = mutate_routing(&store, r.id, 3, |agg| {
            calls += 1;
            // First plan is stale on purpose.
            let revision = if calls == 1 { agg.routing.revision + 7 } else { agg.routing.revision };
            Ok((RoutingChangeSet::new(agg.routing.id, revision), agg.routing.revision))
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(seen, 0);
        assert_eq!(committed.revision, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let store = InMemoryRoutingStore::new();
        let r = store.insert_routing(RoutingDraft::empty(routing())).await.unwrap();

        let err = mutate_routing(&store, r.id, 2, |agg| {
            Ok((RoutingChangeSet::new(agg.routing.id, 99), ()))
        })
        .await
        .unwrap_err();

        assert_eq!(err, RoutingError::ConcurrentModification { routing: r.id, attempts: 3 });
    }

    #[tokio::test]
    async fn test_plan_errors_are_final() {
        let store = InMemoryRoutingStore::new();
        let r = store.insert_routing(RoutingDraft::empty(routing())).await.unwrap();

        let mut calls = 0;
        let err = mutate_routing::<_, (), _>(&store, r.id, 3, |agg| {
            calls += 1;
            Err(RoutingError::StructureLocked {
                routing: agg.routing.id,
                state: agg.routing.state,
            })
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, RoutingError::StructureLocked { .. }));
    }
}
