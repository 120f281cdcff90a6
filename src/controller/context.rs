use crate::controller::cdevents::EventSink;
use crate::controller::clock::Clock;
use crate::gateway::WorkloadGateway;
use crate::server::SharedMetrics;
use crate::store::PipelineStore;
use std::sync::Arc;

/// Collaborators shared by the workflows and the capture workers
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn PipelineStore>,
    pub gateway: Arc<dyn WorkloadGateway>,
    pub cdevents_sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        gateway: Arc<dyn WorkloadGateway>,
        cdevents_sink: impl EventSink + 'static,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            store,
            gateway,
            cdevents_sink: Arc::new(cdevents_sink),
            clock,
            metrics,
        }
    }

    /// Count a workflow run and its duration
    pub fn observe(&self, workflow: &str, started: std::time::Instant, ok: bool) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_workflow(workflow, ok, started.elapsed().as_secs_f64());
        }
    }

    /// Context over in-memory collaborators, with typed handles for assertions
    #[cfg(test)]
    pub fn new_mock() -> (Self, Mocks) {
        use crate::controller::cdevents::MockEventSink;
        use crate::controller::clock::MockClock;
        use crate::gateway::mock::MockGateway;
        use crate::store::MemoryStore;

        let clock = Arc::new(MockClock::fixed());
        let mocks = Mocks {
            store: Arc::new(MemoryStore::new(clock.clone())),
            gateway: Arc::new(MockGateway::new()),
            events: Arc::new(MockEventSink::new()),
            clock: clock.clone(),
        };
        let ctx = Context {
            store: mocks.store.clone(),
            gateway: mocks.gateway.clone(),
            cdevents_sink: mocks.events.clone(),
            clock,
            metrics: None,
        };
        (ctx, mocks)
    }

    /// Same as [`Context::new_mock`] with a pre-seeded gateway
    #[cfg(test)]
    pub fn with_gateway(gateway: crate::gateway::mock::MockGateway) -> (Self, Mocks) {
        let (mut ctx, mut mocks) = Self::new_mock();
        mocks.gateway = Arc::new(gateway);
        ctx.gateway = mocks.gateway.clone();
        (ctx, mocks)
    }
}

#[cfg(test)]
pub struct Mocks {
    pub store: Arc<crate::store::MemoryStore>,
    pub gateway: Arc<crate::gateway::mock::MockGateway>,
    pub events: Arc<crate::controller::cdevents::MockEventSink>,
    pub clock: Arc<crate::controller::clock::MockClock>,
}
