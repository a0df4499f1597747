//! Prometheus metrics for the admission pipeline
//!
//! Scraped by the operator's monitoring stack; the registry is shared
//! so deployments can merge these with their own collectors.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// All admission metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Successful admissions since startup
    pub connects_accepted_total: IntCounter,
    /// Refused CONNECTs, labeled by CONNACK reason code
    pub connects_refused_total: IntCounterVec,
    /// Session takeovers performed
    pub takeovers_total: IntCounter,
    /// Takeover attempts that exhausted the retry cap and displaced
    /// unconditionally
    pub takeover_retries_exhausted_total: IntCounter,
    /// Authenticator submissions refused because the extension task
    /// queue was full (credited as CONTINUE)
    pub auth_task_queue_full_total: IntCounter,
    /// Wall time from CONNECT to flushed CONNACK
    pub connect_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connects_accepted_total = IntCounter::with_opts(Opts::new(
            "gatemq_connects_accepted_total",
            "Successful client admissions since startup",
        ))
        .unwrap();

        let connects_refused_total = IntCounterVec::new(
            Opts::new(
                "gatemq_connects_refused_total",
                "Refused CONNECT packets by CONNACK reason code",
            ),
            &["reason"],
        )
        .unwrap();

        let takeovers_total = IntCounter::with_opts(Opts::new(
            "gatemq_takeovers_total",
            "Connections displaced by a newer connection with the same client id",
        ))
        .unwrap();

        let takeover_retries_exhausted_total = IntCounter::with_opts(Opts::new(
            "gatemq_takeover_retries_exhausted_total",
            "Takeovers that gave up waiting on a concurrent takeover and displaced unconditionally",
        ))
        .unwrap();

        let auth_task_queue_full_total = IntCounter::with_opts(Opts::new(
            "gatemq_auth_task_queue_full_total",
            "Authenticator tasks dropped because the extension task queue was full",
        ))
        .unwrap();

        let connect_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gatemq_connect_duration_seconds",
                "Time from CONNECT receipt to flushed CONNACK",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        registry
            .register(Box::new(connects_accepted_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connects_refused_total.clone()))
            .unwrap();
        registry.register(Box::new(takeovers_total.clone())).unwrap();
        registry
            .register(Box::new(takeover_retries_exhausted_total.clone()))
            .unwrap();
        registry
            .register(Box::new(auth_task_queue_full_total.clone()))
            .unwrap();
        registry.register(Box::new(connect_duration.clone())).unwrap();

        Self {
            registry,
            connects_accepted_total,
            connects_refused_total,
            takeovers_total,
            takeover_retries_exhausted_total,
            auth_task_queue_full_total,
            connect_duration,
        }
    }

    /// Count a refusal under its CONNACK reason code
    pub fn connect_refused(&self, reason: crate::protocol::ReasonCode) {
        self.connects_refused_total
            .with_label_values(&[&reason.to_string()])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
