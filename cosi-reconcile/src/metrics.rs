use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, RwLock};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("cosi")));

/// Engine metrics already registered, by lowercased kind.
static ENGINE_METRICS: LazyLock<Mutex<HashMap<String, EngineMetrics>>> =
    LazyLock::new(Default::default);

/// Encodes the global registry in the OpenMetrics text format.
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(|p| p.into_inner());
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(_) => buffer,
        Err(_) => "".into(),
    }
}

#[derive(Clone)]
pub struct EngineMetrics {
    pub ops: Family<OpLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
    pub queue_depth: Gauge,
}

impl EngineMetrics {
    /// Engine metrics of one resource kind, registered on first use. Engines
    /// of the same kind share them.
    pub fn for_kind(kind: &str) -> Self {
        let kind = kind.to_lowercase();
        let mut registered = ENGINE_METRICS.lock().unwrap_or_else(|p| p.into_inner());
        registered
            .entry(kind.clone())
            .or_insert_with(|| Self::register(kind))
            .clone()
    }

    fn register(kind: String) -> Self {
        let mut guard = REGISTRY.write().unwrap_or_else(|p| p.into_inner());
        let registry = guard.sub_registry_with_label((Cow::Borrowed("kind"), Cow::Owned(kind)));
        let ops = Family::<OpLabels, Counter>::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());
        let queue_depth = Gauge::default();

        registry.register_with_unit(
            "op_duration",
            "listener op duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register("op_failures", "Number of failed listener ops", failures.clone());
        registry.register("ops", "Number of listener ops", ops.clone());
        registry.register("queue_depth", "Items waiting in the work queue", queue_depth.clone());
        Self {
            ops,
            failures,
            duration,
            queue_depth,
        }
    }

    pub fn count_failure(&self, op: &str, error: String) {
        self.failures
            .get_or_create(&ErrorLabels {
                op: op.to_string(),
                error,
            })
            .inc();
    }

    pub fn count_and_measure(&self, op: &str) -> OpMeasurer {
        self.ops
            .get_or_create(&OpLabels { op: op.to_string() })
            .inc();
        OpMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

pub struct OpMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for OpMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    pub op: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub op: String,
    pub error: String,
}
