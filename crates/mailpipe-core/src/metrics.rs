//! Prometheus metrics for the delivery pipeline

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Pipeline metrics, registered on a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub messages_sent: IntCounter,
    pub messages_failed: IntCounter,
    pub messages_retried: IntCounter,
    pub messages_enqueued: IntCounterVec,
    pub tracking_events: IntCounterVec,
    pub cron_job_failures: IntCounterVec,
    pub cron_job_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("mailpipe".to_string()), None)?;

        let messages_sent = IntCounter::new("messages_sent_total", "Messages accepted by the provider")?;
        let messages_failed =
            IntCounter::new("messages_failed_total", "Messages that reached the failed state")?;
        let messages_retried =
            IntCounter::new("messages_retried_total", "Messages rescheduled after a transient failure")?;
        let messages_enqueued = IntCounterVec::new(
            Opts::new("messages_enqueued_total", "Messages written to the queue"),
            &["source"],
        )?;
        let tracking_events = IntCounterVec::new(
            Opts::new("tracking_events_total", "Recorded tracking events"),
            &["event"],
        )?;
        let cron_job_failures = IntCounterVec::new(
            Opts::new("cron_job_failures_total", "Failed orchestrator jobs"),
            &["job"],
        )?;
        let cron_job_duration = HistogramVec::new(
            HistogramOpts::new("cron_job_duration_seconds", "Orchestrator job duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["job"],
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(messages_retried.clone()))?;
        registry.register(Box::new(messages_enqueued.clone()))?;
        registry.register(Box::new(tracking_events.clone()))?;
        registry.register(Box::new(cron_job_failures.clone()))?;
        registry.register(Box::new(cron_job_duration.clone()))?;

        Ok(Self {
            registry,
            messages_sent,
            messages_failed,
            messages_retried,
            messages_enqueued,
            tracking_events,
            cron_job_failures,
            cron_job_duration,
        })
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
