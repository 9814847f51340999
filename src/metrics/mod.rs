//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap lifecycle and outcomes
//! - Peer and syncer traffic
//! - Wallet request latency and failures
//! - Checkpoint activity and bus health

use crate::protocol::SwapRole;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Swap lifecycle metrics
    pub static ref SWAPS_RUNNING: GaugeVec = register_gauge_vec!(
        "strait_swaps_running",
        "Number of swaps currently running",
        &[]
    ).unwrap();

    pub static ref SWAPS_STARTED: CounterVec = register_counter_vec!(
        "strait_swaps_started_total",
        "Total swaps started by protocol role",
        &["role"]
    ).unwrap();

    pub static ref SWAP_OUTCOMES: CounterVec = register_counter_vec!(
        "strait_swap_outcomes_total",
        "Total terminated swaps by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SWAPS_STALLED: CounterVec = register_counter_vec!(
        "strait_swaps_stalled_total",
        "Total swap stall notices raised",
        &[]
    ).unwrap();

    pub static ref SWAPS_HALTED: CounterVec = register_counter_vec!(
        "strait_swaps_halted_total",
        "Total swaps halted on unrecoverable errors",
        &[]
    ).unwrap();

    // State machine metrics
    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "strait_state_transitions_total",
        "Total state machine transitions",
        &[]
    ).unwrap();

    pub static ref UNEXPECTED_EVENTS: CounterVec = register_counter_vec!(
        "strait_unexpected_events_total",
        "Total inputs dropped as unexpected for the current state",
        &[]
    ).unwrap();

    // Traffic metrics
    pub static ref PEER_MESSAGES_RECEIVED: CounterVec = register_counter_vec!(
        "strait_peer_messages_received_total",
        "Total counterparty messages received by kind",
        &["kind"]
    ).unwrap();

    pub static ref PEER_MESSAGES_SENT: CounterVec = register_counter_vec!(
        "strait_peer_messages_sent_total",
        "Total counterparty messages sent by kind",
        &["kind"]
    ).unwrap();

    pub static ref SYNCER_EVENTS: CounterVec = register_counter_vec!(
        "strait_syncer_events_total",
        "Total chain events received by kind",
        &["kind"]
    ).unwrap();

    pub static ref PENDING_BUFFERED: CounterVec = register_counter_vec!(
        "strait_pending_messages_buffered_total",
        "Total peer messages buffered ahead of their state",
        &[]
    ).unwrap();

    pub static ref PENDING_FLUSHED: CounterVec = register_counter_vec!(
        "strait_pending_messages_flushed_total",
        "Total buffered peer messages released",
        &[]
    ).unwrap();

    // Checkpoint metrics
    pub static ref CHECKPOINTS_WRITTEN: CounterVec = register_counter_vec!(
        "strait_checkpoints_written_total",
        "Total checkpoints written by tag",
        &["tag"]
    ).unwrap();

    pub static ref CHECKPOINTS_RESTORED: CounterVec = register_counter_vec!(
        "strait_checkpoints_restored_total",
        "Total swaps restored from a checkpoint",
        &[]
    ).unwrap();

    // Chain interaction metrics
    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "strait_broadcasts_total",
        "Total transactions handed to syncerd for broadcast",
        &["label"]
    ).unwrap();

    pub static ref WATCHES_REGISTERED: CounterVec = register_counter_vec!(
        "strait_watches_registered_total",
        "Total watch tasks registered with syncerd",
        &[]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_LATENCY: HistogramVec = register_histogram_vec!(
        "strait_wallet_request_seconds",
        "Wallet request round-trip latency",
        &["request"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    pub static ref WALLET_FAILURES: CounterVec = register_counter_vec!(
        "strait_wallet_failures_total",
        "Total failed or rejected wallet requests",
        &["request"]
    ).unwrap();

    // Bus metrics
    pub static ref BUS_RECONNECTS: CounterVec = register_counter_vec!(
        "strait_bus_reconnects_total",
        "Total collaborator link reconnect attempts",
        &["service"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "strait_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "strait_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn set_swaps_running(count: i64) {
    SWAPS_RUNNING.with_label_values(&[]).set(count as f64);
}

pub fn record_swap_started(role: SwapRole) {
    let role = match role {
        SwapRole::Alice => "alice",
        SwapRole::Bob => "bob",
    };
    SWAPS_STARTED.with_label_values(&[role]).inc();
}

pub fn record_swap_outcome(outcome: &str) {
    SWAP_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_swap_stalled() {
    SWAPS_STALLED.with_label_values(&[]).inc();
}

pub fn record_swap_halted() {
    SWAPS_HALTED.with_label_values(&[]).inc();
}

pub fn record_state_transition() {
    STATE_TRANSITIONS.with_label_values(&[]).inc();
}

pub fn record_unexpected_event() {
    UNEXPECTED_EVENTS.with_label_values(&[]).inc();
}

pub fn record_peer_message(kind: &str) {
    PEER_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
}

pub fn record_peer_message_sent(kind: &str) {
    PEER_MESSAGES_SENT.with_label_values(&[kind]).inc();
}

pub fn record_syncer_event(kind: &str) {
    SYNCER_EVENTS.with_label_values(&[kind]).inc();
}

pub fn record_pending_buffered() {
    PENDING_BUFFERED.with_label_values(&[]).inc();
}

pub fn record_pending_flushed(count: u64) {
    PENDING_FLUSHED.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_checkpoint_written(tag: &str) {
    CHECKPOINTS_WRITTEN.with_label_values(&[tag]).inc();
}

pub fn record_checkpoint_restored() {
    CHECKPOINTS_RESTORED.with_label_values(&[]).inc();
}

pub fn record_broadcast(label: &str) {
    BROADCASTS.with_label_values(&[label]).inc();
}

pub fn record_watch_registered() {
    WATCHES_REGISTERED.with_label_values(&[]).inc();
}

pub fn observe_wallet_request(request: &str, latency_secs: f64) {
    WALLET_LATENCY
        .with_label_values(&[request])
        .observe(latency_secs);
}

pub fn record_wallet_failure(request: &str) {
    WALLET_FAILURES.with_label_values(&[request]).inc();
}

pub fn record_bus_reconnect(service: &str) {
    BUS_RECONNECTS.with_label_values(&[service]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
