use kubedeck_core::session::{CloseReason, SessionKind};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SessionMetrics {
    started: Family<KindLabels, Counter>,
    closed: Family<CloseLabels, Counter>,
    active: Family<KindLabels, Gauge>,
    duration: Family<KindLabels, Histogram>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CloseLabels {
    kind: &'static str,
    reason: &'static str,
}

// === impl SessionMetrics ===

impl SessionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "sessions_started",
            "Total number of proxy sessions started",
            metrics.started.clone(),
        );
        reg.register(
            "sessions_closed",
            "Total number of proxy sessions closed by reason",
            metrics.closed.clone(),
        );
        reg.register(
            "sessions_active",
            "Number of proxy sessions currently open",
            metrics.active.clone(),
        );
        reg.register_with_unit(
            "session_duration",
            "Lifetime of closed proxy sessions",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        metrics
    }

    pub(crate) fn started(&self, kind: SessionKind) {
        let labels = KindLabels {
            kind: kind.as_str(),
        };
        self.started.get_or_create(&labels).inc();
        self.active.get_or_create(&labels).inc();
    }

    pub(crate) fn closed(&self, kind: SessionKind, reason: CloseReason, lifetime: Duration) {
        let labels = KindLabels {
            kind: kind.as_str(),
        };
        self.active.get_or_create(&labels).dec();
        self.duration
            .get_or_create(&labels)
            .observe(lifetime.as_secs_f64());
        self.closed
            .get_or_create(&CloseLabels {
                kind: kind.as_str(),
                reason: reason.as_str(),
            })
            .inc();
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        let duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // Node shells are capped at four hours.
            Histogram::new([1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0])
        });
        Self {
            started: Family::default(),
            closed: Family::default(),
            active: Family::default(),
            duration,
        }
    }
}
