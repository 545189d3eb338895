use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::action::Action;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub action: Action,
    pub outcome: ActionOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ActionOutcome {
    Success,
    PrivateAccess,
    NotMirrored,
    Unsupported,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionNameLabels {
    pub action: Action,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub event: WebhookEvent,
    pub outcome: WebhookOutcome,
}

/// Event header value, collapsed so unknown events share one series.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WebhookEvent {
    Ping,
    Push,
    Other,
}

impl WebhookEvent {
    pub fn from_header(event: &str) -> Self {
        match event {
            "ping" => WebhookEvent::Ping,
            "push" => WebhookEvent::Push,
            _ => WebhookEvent::Other,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WebhookOutcome {
    Pong,
    Updated,
    Skipped,
    NotMirrored,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the server.
pub struct Metrics {
    // -- mirror actions --
    pub mirror_actions_total: Family<ActionLabels, Counter>,
    pub mirror_action_duration_seconds: Family<ActionNameLabels, Histogram>,

    // -- webhooks --
    pub webhook_deliveries_total: Family<WebhookLabels, Counter>,

    // -- remote API --
    pub remote_api_calls: Family<EndpointLabels, Counter>,

    // -- gauges --
    pub mirrors_total: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let mirror_actions_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "doppelganger_mirror_actions",
            "Mirror actions by action and outcome",
            mirror_actions_total.clone(),
        );

        let mirror_action_duration_seconds =
            Family::<ActionNameLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.05, 2.0, 14))
            });
        registry.register(
            "doppelganger_mirror_action_duration_seconds",
            "Mirror action latency in seconds",
            mirror_action_duration_seconds.clone(),
        );

        let webhook_deliveries_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "doppelganger_webhook_deliveries",
            "Webhook deliveries by event and outcome",
            webhook_deliveries_total.clone(),
        );

        let remote_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "doppelganger_remote_api_calls",
            "Remote API call count by endpoint",
            remote_api_calls.clone(),
        );

        let mirrors_total: Gauge = Gauge::default();
        registry.register(
            "doppelganger_mirrors_total",
            "Number of mirrors found by the last listing",
            mirrors_total.clone(),
        );

        Self {
            mirror_actions_total,
            mirror_action_duration_seconds,
            webhook_deliveries_total,
            remote_api_calls,
            mirrors_total,
        }
    }

    pub fn record_action(&self, action: Action, outcome: ActionOutcome) {
        self.mirror_actions_total
            .get_or_create(&ActionLabels { action, outcome })
            .inc();
    }

    pub fn record_webhook(&self, event: WebhookEvent, outcome: WebhookOutcome) {
        self.webhook_deliveries_total
            .get_or_create(&WebhookLabels { event, outcome })
            .inc();
    }

    pub fn record_remote_call(&self, endpoint: &str) {
        self.remote_api_calls
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Encode the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
