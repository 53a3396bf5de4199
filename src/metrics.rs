use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::error;

use crate::event::{EventData, EventError};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C>(collector: C) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if let Err(err) = REGISTRY.register(Box::new(collector.clone())) {
        error!(?err, "failed to register collector");
    }
    collector
}

static EVENT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            histogram_opts!(
                "tsuru_events_duration_seconds",
                "The duration of events in seconds",
                vec![1.0, 5.0, 10.0, 60.0, 600.0, 1800.0]
            ),
            &["kind"],
        )
        .expect("create event duration histogram"),
    )
});

static EVENT_CURRENT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new("tsuru_events_current", "The number of events currently running"),
            &["kind"],
        )
        .expect("create current events gauge"),
    )
});

static EVENTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("tsuru_events_rejected_total", "The total number of events rejected"),
            &["kind", "reason"],
        )
        .expect("create rejected events counter"),
    )
});

static EVENTS_EXPIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("tsuru_events_expired_total", "The total number of events expired"),
            &["kind"],
        )
        .expect("create expired events counter"),
    )
});

static WEBHOOKS_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register(
        Histogram::with_opts(histogram_opts!(
            "tsuru_webhooks_latency_seconds",
            "The latency for webhooks requests in seconds"
        ))
        .expect("create webhook latency histogram"),
    )
});

static WEBHOOKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("tsuru_webhooks_calls_total", "The total number of webhooks calls")
            .expect("create webhook calls counter"),
    )
});

static WEBHOOKS_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "tsuru_webhooks_calls_error",
            "The total number of webhooks calls with error",
        )
        .expect("create webhook errors counter"),
    )
});

static WEBHOOKS_QUEUE: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new(
            "tsuru_webhooks_event_queue_current",
            "The current number of queued events waiting for webhooks processing",
        )
        .expect("create webhook queue gauge"),
    )
});

static SERVICE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            histogram_opts!(
                "tsuru_service_request_duration_seconds",
                "The service requests latency distributions."
            ),
            &["service"],
        )
        .expect("create service latency histogram"),
    )
});

static SERVICE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "tsuru_service_request_errors_total",
                "The total number of service request errors.",
            ),
            &["service"],
        )
        .expect("create service errors counter"),
    )
});

/// Register every collector so `/metrics` lists them before first use.
pub fn register_metrics() {
    Lazy::force(&EVENT_DURATION);
    Lazy::force(&EVENT_CURRENT);
    Lazy::force(&EVENTS_REJECTED);
    Lazy::force(&EVENTS_EXPIRED);
    Lazy::force(&WEBHOOKS_LATENCY);
    Lazy::force(&WEBHOOKS_TOTAL);
    Lazy::force(&WEBHOOKS_ERROR);
    Lazy::force(&WEBHOOKS_QUEUE);
    Lazy::force(&SERVICE_LATENCY);
    Lazy::force(&SERVICE_ERRORS);
}

pub fn event_started(kind: &str) {
    EVENT_CURRENT.with_label_values(&[kind]).inc();
}

pub fn event_rejected(kind: &str, err: &EventError) {
    let reason = match err {
        EventError::Locked(_) => "locked",
        EventError::Throttled(_) => "throttled",
        _ => "other",
    };
    EVENTS_REJECTED.with_label_values(&[kind, reason]).inc();
}

/// Record a running event reaching its terminal state.
pub fn event_finished(evt: &EventData) {
    let kind = evt.kind.name.as_str();
    EVENT_CURRENT.with_label_values(&[kind]).dec();
    if let Some(end) = evt.end_time {
        let elapsed = (end - evt.start_time).to_std().unwrap_or_default();
        EVENT_DURATION
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }
}

pub fn event_expired(evt: &EventData) {
    EVENTS_EXPIRED
        .with_label_values(&[evt.kind.name.as_str()])
        .inc();
    event_finished(evt);
}

/// An event discarded before finishing.
pub fn event_aborted(kind: &str) {
    EVENT_CURRENT.with_label_values(&[kind]).dec();
}

pub fn webhook_queued() {
    WEBHOOKS_QUEUE.inc();
}

pub fn webhook_dequeued() {
    WEBHOOKS_QUEUE.dec();
}

pub fn webhook_call(elapsed: Duration, failed: bool) {
    WEBHOOKS_TOTAL.inc();
    WEBHOOKS_LATENCY.observe(elapsed.as_secs_f64());
    if failed {
        WEBHOOKS_ERROR.inc();
    }
}

pub fn service_request(service: &str, elapsed: Duration, failed: bool) {
    SERVICE_LATENCY
        .with_label_values(&[service])
        .observe(elapsed.as_secs_f64());
    if failed {
        SERVICE_ERRORS.with_label_values(&[service]).inc();
    }
}

/// GET /metrics - prometheus text exposition
pub async fn handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
    }
    match HeaderValue::from_str(encoder.format_type()) {
        Ok(value) => ([(CONTENT_TYPE, value)], buffer).into_response(),
        Err(err) => {
            error!(?err, "failed to build content-type header");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_labelled_by_reason() {
        let kind = "metrics.test.rejected";
        event_rejected(kind, &EventError::Locked("holder".into()));
        event_rejected(kind, &EventError::Throttled("busy".into()));
        event_rejected(kind, &EventError::NotFound);
        for reason in ["locked", "throttled", "other"] {
            assert_eq!(EVENTS_REJECTED.with_label_values(&[kind, reason]).get(), 1);
        }
    }

    #[test]
    fn test_service_errors_only_count_failures() {
        service_request("metrics-test-svc", Duration::from_millis(5), false);
        service_request("metrics-test-svc", Duration::from_millis(5), true);
        assert_eq!(
            SERVICE_ERRORS.with_label_values(&["metrics-test-svc"]).get(),
            1
        );
        assert_eq!(
            SERVICE_LATENCY
                .with_label_values(&["metrics-test-svc"])
                .get_sample_count(),
            2
        );
    }

    #[tokio::test]
    async fn test_journal_tracks_running_events() {
        use crate::event::journal::JournalSettings;
        use crate::event::{AllowedPermission, Journal, MemoryEventStore, Opts, Owner, Target};
        use crate::permission::Context;
        use std::sync::Arc;

        let journal = Journal::new(
            Arc::new(MemoryEventStore::new()),
            JournalSettings {
                lock_expire: Duration::from_secs(60),
                lock_update_interval: Duration::from_secs(5),
                app_lock_retry: Duration::ZERO,
                throttling: Vec::new(),
            },
        );
        let kind = "metrics.test.journal";
        let opts = || Opts {
            target: Some(Target::app("metrics-app")),
            kind: Some(kind.to_string()),
            owner: Some(Owner::internal()),
            allowed: AllowedPermission::new("app.read.events", vec![Context::app("metrics-app")]),
            ..Default::default()
        };

        let evt = journal.new_event(opts()).await.unwrap();
        assert_eq!(EVENT_CURRENT.with_label_values(&[kind]).get(), 1);
        assert!(journal.new_event(opts()).await.is_err());
        assert_eq!(EVENTS_REJECTED.with_label_values(&[kind, "locked"]).get(), 1);

        evt.done(None).await.unwrap();
        assert_eq!(EVENT_CURRENT.with_label_values(&[kind]).get(), 0);
        assert_eq!(EVENT_DURATION.with_label_values(&[kind]).get_sample_count(), 1);
    }
}
