//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Resolution Metrics
    pub static ref ACTOR_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_actor_resolutions_total", "Total number of actor resolutions"),
        &["reference_kind", "status"]
    ).expect("metric can be created");
    pub static ref ACTORS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_actors_created_total", "Total number of remote actors created"),
        &["actor_kind"]
    ).expect("metric can be created");
    pub static ref REMOTE_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_remote_fetches_total", "Total number of remote discovery fetches"),
        &["operation", "status"]
    ).expect("metric can be created");
    pub static ref REMOTE_FETCH_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedcore_remote_fetch_duration_seconds",
            "Remote discovery fetch duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["operation"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedcore_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_delivery_attempts_total", "Total number of outbound delivery attempts"),
        &["mode", "status"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_deliveries_total", "Total number of finished outbound deliveries"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "fedcore_delivery_queue_depth",
        "Current number of messages waiting in the delivery queue"
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_signature_verifications_total", "Total number of inbound signature checks"),
        &["result"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_errors_total", "Total number of errors"),
        &["error_type", "operation"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTOR_RESOLUTIONS_TOTAL.clone()))
        .expect("ACTOR_RESOLUTIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTORS_CREATED_TOTAL.clone()))
        .expect("ACTORS_CREATED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REMOTE_FETCHES_TOTAL.clone()))
        .expect("REMOTE_FETCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REMOTE_FETCH_DURATION_SECONDS.clone()))
        .expect("REMOTE_FETCH_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_QUEUE_DEPTH.clone()))
        .expect("DELIVERY_QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()))
        .expect("SIGNATURE_VERIFICATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record one remote discovery fetch.
pub fn observe_remote_fetch(operation: &str, status: &str, elapsed: Duration) {
    REMOTE_FETCHES_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    REMOTE_FETCH_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

/// Record an error by its stable kind label.
pub fn record_error(error: &crate::error::AppError, operation: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error.kind(), operation])
        .inc();
}
