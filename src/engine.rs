//! Routing engine facade.
//!
//! Wires the lifecycle manager, step sequencer and composer over one shared
//! store and collaborator set. Hosts typically build one engine at startup
//! and clone it into request handlers.

use std::sync::Arc;

use crate::collaborators::{ProcessSegmentCatalog, StaticSegmentCatalog, StaticWorkOrders, WorkOrderGateway};
use crate::composer::RoutingComposer;
use crate::config::EngineConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::lifecycle::RoutingLifecycleManager;
use crate::sequencer::StepSequencer;
use crate::store::{InMemoryRoutingStore, RoutingStore};
use crate::types::{RoutingAggregate, RoutingId};

/// All routing operations over one store.
pub struct RoutingEngine<S, W, C> {
    store: Arc<S>,
    lifecycle: RoutingLifecycleManager<S, W>,
    sequencer: StepSequencer<S>,
    composer: RoutingComposer<S, C>,
    config: EngineConfig,
}

impl<S, W, C> Clone for RoutingEngine<S, W, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lifecycle: self.lifecycle.clone(),
            sequencer: self.sequencer.clone(),
            composer: self.composer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, W, C> RoutingEngine<S, W, C>
where
    S: RoutingStore,
    W: WorkOrderGateway,
    C: ProcessSegmentCatalog,
{
    /// Build an engine over a store and its collaborators.
    pub fn new(store: Arc<S>, work_orders: Arc<W>, catalog: Arc<C>, config: EngineConfig) -> Self {
        tracing::info!(
            max_commit_retries = config.max_commit_retries,
            routing_number_prefix = %config.routing_number_prefix,
            "Routing engine initialised"
        );
        Self {
            lifecycle: RoutingLifecycleManager::new(Arc::clone(&store), work_orders, config.clone()),
            sequencer: StepSequencer::new(Arc::clone(&store), config.clone()),
            composer: RoutingComposer::new(Arc::clone(&store), catalog, config.clone()),
            store,
            config,
        }
    }

    /// Lifecycle transitions, metadata, primary route, deletion.
    pub fn lifecycle(&self) -> &RoutingLifecycleManager<S, W> {
        &self.lifecycle
    }

    /// Step and dependency edits.
    pub fn sequencer(&self) -> &StepSequencer<S> {
        &self.sequencer
    }

    /// Copy, versions, validation, timing, availability.
    pub fn composer(&self) -> &RoutingComposer<S, C> {
        &self.composer
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A routing with its steps and dependencies.
    pub async fn get_aggregate(&self, id: &RoutingId) -> RoutingResult<RoutingAggregate> {
        self.store
            .load_aggregate(id)
            .await?
            .ok_or(RoutingError::RoutingNotFound(*id))
    }
}

/// Engine over in-memory store and collaborators.
pub type InMemoryRoutingEngine = RoutingEngine<InMemoryRoutingStore, StaticWorkOrders, StaticSegmentCatalog>;

impl InMemoryRoutingEngine {
    /// In-memory engine. Returns the collaborators so callers can seed them.
    pub fn in_memory(config: EngineConfig) -> (Self, Arc<StaticWorkOrders>, Arc<StaticSegmentCatalog>) {
        let store = Arc::new(InMemoryRoutingStore::with_numbering(config.number_format()));
        let work_orders = Arc::new(StaticWorkOrders::new());
        let catalog = Arc::new(StaticSegmentCatalog::new());
        let engine = Self::new(store, Arc::clone(&work_orders), Arc::clone(&catalog), config);
        (engine, work_orders, catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewRouting, NewStep};

    #[tokio::test]
    async fn test_in_memory_engine_uses_configured_numbering() {
        let config = EngineConfig {
            routing_number_prefix: "RT".into(),
            sequence_width: 4,
            ..EngineConfig::default()
        };
        let (engine, _, _) = InMemoryRoutingEngine::in_memory(config);
        let r = engine
            .lifecycle()
            .create_routing(NewRouting::new("PN001", "DAL"))
            .await
            .unwrap();
        assert_eq!(r.routing_number, "RT-DAL-PN001-0001");

        engine.sequencer().add_step(&r.id, NewStep::new(10, "seg-mill")).await.unwrap();
        let agg = engine.get_aggregate(&r.id).await.unwrap();
        assert_eq!(agg.steps.len(), 1);
        assert_eq!(agg.routing.revision, 1);
    }
}
