//! Interfaces to systems the engine consumes but does not own.
//!
//! Both collaborators are resolved at call time. The engine never caches
//! their answers: work-order counts and segment defaults are mutable master
//! data owned elsewhere.

use std::collections::BTreeMap;
use std::convert::Infallible;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{ProcessSegmentId, RoutingId, SegmentTiming};

/// Work-order system, consulted before a routing is deleted.
#[async_trait]
pub trait WorkOrderGateway: Send + Sync {
    /// Error type for this gateway.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Number of active work orders that reference the routing.
    async fn count_active_work_orders_using_routing(
        &self,
        routing: &RoutingId,
    ) -> Result<u32, Self::Error>;
}

/// Process-segment master data, consulted for default step timings.
#[async_trait]
pub trait ProcessSegmentCatalog: Send + Sync {
    /// Error type for this catalog.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Default setup/cycle/teardown of a segment, `None` if unknown.
    async fn segment_timing(
        &self,
        segment: &ProcessSegmentId,
    ) -> Result<Option<SegmentTiming>, Self::Error>;
}

/// Work-order counts held in memory.
#[derive(Debug, Default)]
pub struct StaticWorkOrders {
    counts: RwLock<BTreeMap<RoutingId, u32>>,
}

impl StaticWorkOrders {
    /// Gateway reporting zero work orders everywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active work-order count for a routing.
    pub fn set_count(&self, routing: RoutingId, count: u32) {
        let mut counts = self.counts.write();
        if count == 0 {
            counts.remove(&routing);
        } else {
            counts.insert(routing, count);
        }
    }
}

#[async_trait]
impl WorkOrderGateway for StaticWorkOrders {
    type Error = Infallible;

    async fn count_active_work_orders_using_routing(
        &self,
        routing: &RoutingId,
    ) -> Result<u32, Self::Error> {
        Ok(self.counts.read().get(routing).copied().unwrap_or(0))
    }
}

/// Segment timings held in memory.
#[derive(Debug, Default)]
pub struct StaticSegmentCatalog {
    segments: RwLock<BTreeMap<ProcessSegmentId, SegmentTiming>>,
}

impl StaticSegmentCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_segment(self, segment: impl Into<ProcessSegmentId>, timing: SegmentTiming) -> Self {
        self.set_segment(segment, timing);
        self
    }

    /// Insert or replace a segment's default timing.
    pub fn set_segment(&self, segment: impl Into<ProcessSegmentId>, timing: SegmentTiming) {
        self.segments.write().insert(segment.into(), timing);
    }

    /// Remove a segment.
    pub fn remove_segment(&self, segment: &ProcessSegmentId) {
        self.segments.write().remove(segment);
    }
}

#[async_trait]
impl ProcessSegmentCatalog for StaticSegmentCatalog {
    type Error = Infallible;

    async fn segment_timing(
        &self,
        segment: &ProcessSegmentId,
    ) -> Result<Option<SegmentTiming>, Self::Error> {
        Ok(self.segments.read().get(segment).copied())
    }
}
