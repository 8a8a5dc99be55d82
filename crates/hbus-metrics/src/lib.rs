//! Metrics for the router bus hub.
//!
//! Every metric the hub records is declared once here as a [`Metric`]
//! constant. Call sites use the `metrics` macros with the declared name:
//!
//! ```rust,ignore
//! use hbus_metrics::{metric_defs, RouterLabels};
//!
//! let labels = RouterLabels::new(1);
//! metrics::counter!(metric_defs::BUS_RESYNCS.name, &labels.to_labels()).increment(1);
//! ```
//!
//! Nothing is exported unless a recorder is installed; with the
//! `prometheus` feature [`install_prometheus`] serves them over HTTP.

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

/// A metric declaration with its metadata.
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "hbus.bus.frames").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the hub.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Bus Read Side
    // ========================================================================

    /// Frames accepted by the event stream.
    pub const BUS_FRAMES: Metric = Metric::counter("hbus.bus.frames")
        .with_description("Router frames accepted in operate mode")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Resynchronization steps taken on the read side.
    pub const BUS_RESYNCS: Metric = Metric::counter("hbus.bus.resyncs")
        .with_description("Times the read side realigned on a frame marker")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Frames dropped for a bad checksum.
    pub const BUS_CHECKSUM_FAILURES: Metric = Metric::counter("hbus.bus.checksum_failures")
        .with_description("Frames rejected for a checksum mismatch")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Second frames found appended to a first one.
    pub const BUS_APPENDED_FRAMES: Metric = Metric::counter("hbus.bus.appended_frames")
        .with_description("Frames that arrived appended to another frame")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    // ========================================================================
    // Exchange and Mode
    // ========================================================================

    /// Synchronous exchanges that ran out of time.
    pub const EXCHANGE_TIMEOUTS: Metric = Metric::counter("hbus.exchange.timeouts")
        .with_description("Command exchanges that timed out waiting for a reply")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Completed mode transitions.
    pub const MODE_TRANSITIONS: Metric = Metric::counter("hbus.mode.transitions")
        .with_description("Completed bus mode transitions")
        .with_unit(Unit::Count)
        .with_labels(&["router", "target"]);

    /// 1 while the bus is in operate mode.
    pub const MODE_OPERATE: Metric = Metric::gauge("hbus.mode.operate")
        .with_description("1 while the bus is in operate mode, else 0")
        .with_labels(&["router"]);

    /// Exchange time from write to matching reply.
    pub const EXCHANGE_LATENCY: Metric = Metric::histogram("hbus.exchange.latency_ms")
        .with_description("Time from command write to matching reply")
        .with_unit(Unit::Milliseconds)
        .with_labels(&["router"]);

    // ========================================================================
    // Events and Backend
    // ========================================================================

    /// Events produced from frames and mirror deltas.
    pub const EVENTS_PRODUCED: Metric = Metric::counter("hbus.events.produced")
        .with_description("Normalized events produced by the event stream")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Events dropped because the bridge queue was full.
    pub const EVENTS_DROPPED: Metric = Metric::counter("hbus.events.dropped")
        .with_description("Events dropped at the hand-off to the notification bridge")
        .with_unit(Unit::Count)
        .with_labels(&["router"]);

    /// Events acknowledged by the backend.
    pub const EVENTS_DELIVERED: Metric = Metric::counter("hbus.events.delivered")
        .with_description("Events acknowledged by the automation backend")
        .with_unit(Unit::Count);

    /// Events the bridge gave up on.
    pub const EVENTS_FAILED: Metric = Metric::counter("hbus.events.failed")
        .with_description("Events dropped after delivery to the backend failed")
        .with_unit(Unit::Count);

    /// Websocket (re)connections attempted.
    pub const BACKEND_CONNECTS: Metric = Metric::counter("hbus.backend.connects")
        .with_description("Websocket connection attempts to the backend")
        .with_unit(Unit::Count)
        .with_labels(&["outcome"]);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &BUS_FRAMES,
        &BUS_RESYNCS,
        &BUS_CHECKSUM_FAILURES,
        &BUS_APPENDED_FRAMES,
        &EXCHANGE_TIMEOUTS,
        &MODE_TRANSITIONS,
        &MODE_OPERATE,
        &EXCHANGE_LATENCY,
        &EVENTS_PRODUCED,
        &EVENTS_DROPPED,
        &EVENTS_DELIVERED,
        &EVENTS_FAILED,
        &BACKEND_CONNECTS,
    ];
}

/// Labels identifying the router a metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterLabels {
    /// Router id on the bus.
    pub router: u8,
}

impl RouterLabels {
    /// Labels for `router`.
    pub fn new(router: u8) -> Self {
        RouterLabels { router }
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> [(&'static str, String); 1] {
        [("router", self.router.to_string())]
    }

    /// Router labels plus a mode transition target.
    pub fn with_target(&self, target: &str) -> [(&'static str, String); 2] {
        [("router", self.router.to_string()), ("target", target.to_string())]
    }
}

/// Describes all metrics used by the hub.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Install a Prometheus recorder serving `/metrics` on `addr`.
///
/// Must be called from within a tokio runtime.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}
