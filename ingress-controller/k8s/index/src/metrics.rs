use crate::store::Stores;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{counter::Counter, gauge::ConstGauge, MetricType},
    registry::Registry,
};

/// Counters describing the reconcile queue.
#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    pub(crate) adds: Counter,
    pub(crate) coalesced: Counter,
    pub(crate) passes: Counter,
}

#[derive(Debug)]
struct Instrumented(Stores);

/// Registers a gauge of the number of cached objects of each kind.
pub fn register(reg: &mut Registry, stores: Stores) {
    reg.register_collector(Box::new(Instrumented(stores)));
}

// === impl QueueMetrics ===

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let adds = Counter::default();
        prom.register(
            "queue_adds",
            "Count of tasks added to the reconcile queue",
            adds.clone(),
        );

        let coalesced = Counter::default();
        prom.register(
            "queue_coalesced",
            "Count of tasks merged into a task that was already queued",
            coalesced.clone(),
        );

        let passes = Counter::default();
        prom.register(
            "queue_passes",
            "Count of reconciliation passes started",
            passes.clone(),
        );

        Self {
            adds,
            coalesced,
            passes,
        }
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let mut store_encoder = encoder.encode_descriptor(
            "store_size",
            "The number of objects in each cache",
            None,
            MetricType::Gauge,
        )?;
        for (kind, size) in self.0.sizes() {
            let labels = [("kind", kind.as_str())];
            let size = ConstGauge::new(size as u32);
            let size_encoder = store_encoder.encode_family(&labels)?;
            size.encode(size_encoder)?;
        }
        Ok(())
    }
}
