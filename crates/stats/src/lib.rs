//! Process-wide delivery metrics keyed by tag combinations.
//!
//! Views are registered exactly once per process via [`StatsReporter::new`];
//! duplicate registration errors there, which callers treat as fatal at
//! startup. [`StatsReporter::unregister`] exists so repeated registrations
//! within one test process stay idempotent-safe.

#![forbid(unsafe_code)]

use std::time::Duration;

use kubespout_core::{response_code_class, DeliveryOutcome};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

pub mod exporter;

/// Fixed resource-group tag attached to every event count.
pub const IMPORTER_RESOURCE_GROUP: &str = "resourcewatches.sources.kubespout.io";

const EVENT_COUNT_NAME: &str = "event_count";
const DISPATCH_LATENCY_NAME: &str = "event_dispatch_latencies";

const EVENT_COUNT_LABELS: &[&str] = &[
    "namespace_name",
    "event_source",
    "event_type",
    "importer_name",
    "importer_resource_group",
    "result",
    "response_code",
    "response_code_class",
];

const DISPATCH_LATENCY_LABELS: &[&str] = &[
    "namespace_name",
    "event_source",
    "event_type",
    "importer_name",
    "response_code",
    "response_code_class",
];

/// Dispatch latency buckets in milliseconds.
const LATENCY_BUCKETS_MS: &[f64] =
    &[1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0];

/// Value object keying one metrics observation; constructed fresh per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArgs {
    pub namespace: String,
    pub event_type: String,
    pub event_source: String,
    pub importer_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("metrics view registration: {0}")]
    Registration(#[source] prometheus::Error),
    #[error("metrics tag machinery: {0}")]
    Tags(#[source] prometheus::Error),
}

/// Holds the registered metric views for the process lifetime. Cheap to share
/// behind an `Arc`; all increments are internally synchronized.
#[derive(Debug)]
pub struct StatsReporter {
    registry: Registry,
    event_count: CounterVec,
    dispatch_latencies: HistogramVec,
}

impl StatsReporter {
    /// Register the views with the process-wide default registry.
    pub fn new() -> Result<Self, StatsError> {
        Self::with_registry(prometheus::default_registry().clone())
    }

    /// Register the views with an explicit registry (test isolation).
    pub fn with_registry(registry: Registry) -> Result<Self, StatsError> {
        let event_count = CounterVec::new(
            Opts::new(EVENT_COUNT_NAME, "Number of events delivered to the sink"),
            EVENT_COUNT_LABELS,
        )
        .map_err(StatsError::Registration)?;
        let dispatch_latencies = HistogramVec::new(
            HistogramOpts::new(DISPATCH_LATENCY_NAME, "Event dispatch latency in milliseconds")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            DISPATCH_LATENCY_LABELS,
        )
        .map_err(StatsError::Registration)?;

        registry
            .register(Box::new(event_count.clone()))
            .map_err(StatsError::Registration)?;
        if let Err(e) = registry.register(Box::new(dispatch_latencies.clone())) {
            // Leave no half-registered state behind.
            let _ = registry.unregister(Box::new(event_count.clone()));
            return Err(StatsError::Registration(e));
        }

        Ok(Self { registry, event_count, dispatch_latencies })
    }

    /// Count one delivered event. `result` is "success" when the delivery
    /// returned without error; the response code tags are empty when a
    /// transport failure produced no response.
    pub fn report_event_count(
        &self,
        args: &ReportArgs,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StatsError> {
        self.event_count
            .get_metric_with_label_values(&[
                &args.namespace,
                &args.event_source,
                &args.event_type,
                &args.importer_name,
                IMPORTER_RESOURCE_GROUP,
                outcome.outcome.as_str(),
                &outcome.code_tag(),
                &outcome.class_tag(),
            ])
            .map_err(StatsError::Tags)?
            .inc();
        Ok(())
    }

    /// Record how long one dispatch attempt took, tagged by its response code.
    pub fn report_event_dispatch_time(
        &self,
        args: &ReportArgs,
        response_code: u16,
        elapsed: Duration,
    ) -> Result<(), StatsError> {
        self.dispatch_latencies
            .get_metric_with_label_values(&[
                &args.namespace,
                &args.event_source,
                &args.event_type,
                &args.importer_name,
                &response_code.to_string(),
                &response_code_class(response_code),
            ])
            .map_err(StatsError::Tags)?
            .observe(elapsed.as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Remove the views from the registry so a later reporter can register
    /// them again. Only test harnesses need this.
    pub fn unregister(&self) -> Result<(), StatsError> {
        self.registry
            .unregister(Box::new(self.event_count.clone()))
            .map_err(StatsError::Registration)?;
        self.registry
            .unregister(Box::new(self.dispatch_latencies.clone()))
            .map_err(StatsError::Registration)?;
        Ok(())
    }
}
