//! HTTP API for health checks, status, and monitoring

use crate::checkpoint::CheckpointStore;
use crate::config::{ApiConfig, SwapdConfig};
use crate::protocol::SwapId;
use crate::supervisor::FundingBoard;
use crate::swap::manager::SwapManager;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SwapManager>,
    pub store: Arc<CheckpointStore>,
    pub funding: Arc<FundingBoard>,
    pub swapd: SwapdConfig,
    pub started_at: Instant,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    manager: Arc<SwapManager>,
    store: Arc<CheckpointStore>,
    funding: Arc<FundingBoard>,
    swapd: SwapdConfig,
) {
    let state = AppState {
        manager,
        store,
        funding,
        swapd,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/info", get(get_info))
        .route("/swaps", get(get_swaps))
        .route("/swaps/:id", get(get_swap))
        .route("/checkpoints", get(get_checkpoints))
        .route("/funding", get(get_funding))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the checkpoint store answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready: db_ok,
            database: db_ok,
        }),
    )
}

/// Daemon-level information
async fn get_info(State(state): State<AppState>) -> impl IntoResponse {
    let restorable = state
        .store
        .list()
        .await
        .map(|entries| entries.len())
        .unwrap_or(0);

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.swapd.instance_id.clone(),
        network: state.swapd.network.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        running_swaps: state.manager.running().len(),
        awaiting_funding: state.funding.waiting().len(),
        restorable_checkpoints: restorable,
    })
}

/// Ids of the swaps currently running
async fn get_swaps(State(state): State<AppState>) -> impl IntoResponse {
    let swaps = state
        .manager
        .running()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    Json(SwapsResponse { swaps })
}

/// One swap: whether it is running and what its latest checkpoint says
async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let swap_id: SwapId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SwapResponse {
                    swap_id: id,
                    running: false,
                    checkpoint: None,
                }),
            )
        }
    };

    let running = state.manager.is_running(swap_id);
    let checkpoint = state
        .store
        .latest(swap_id)
        .await
        .ok()
        .flatten()
        .map(|snapshot| CheckpointSummary {
            state: snapshot.state.to_string(),
            created_at: snapshot.created_at.to_rfc3339(),
        });

    let code = if running || checkpoint.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        code,
        Json(SwapResponse {
            swap_id: swap_id.to_string(),
            running,
            checkpoint,
        }),
    )
}

/// Restorable checkpoints across all swaps
async fn get_checkpoints(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list().await {
        Ok(entries) => (
            StatusCode::OK,
            Json(CheckpointsResponse {
                checkpoints: entries
                    .into_iter()
                    .map(|entry| CheckpointItem {
                        swap_id: entry.swap_id.to_string(),
                        owner: entry.owner.to_string(),
                        tag: entry.tag.to_string(),
                        created_at: entry.created_at.to_rfc3339(),
                    })
                    .collect(),
            }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CheckpointsResponse {
                checkpoints: Vec::new(),
            }),
        ),
    }
}

/// Swaps waiting on external funds
async fn get_funding(State(state): State<AppState>) -> impl IntoResponse {
    let waiting = state
        .funding
        .waiting()
        .into_iter()
        .map(|need| FundingItem {
            swap_id: need.swap_id.to_string(),
            leg: need.leg.to_string(),
            address: need.address.0,
            amount: need.amount,
        })
        .collect();
    Json(FundingResponse { waiting })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    instance_id: String,
    network: String,
    uptime_seconds: u64,
    running_swaps: usize,
    awaiting_funding: usize,
    restorable_checkpoints: usize,
}

#[derive(Serialize)]
struct SwapsResponse {
    swaps: Vec<String>,
}

#[derive(Serialize)]
struct SwapResponse {
    swap_id: String,
    running: bool,
    checkpoint: Option<CheckpointSummary>,
}

#[derive(Serialize)]
struct CheckpointSummary {
    state: String,
    created_at: String,
}

#[derive(Serialize)]
struct CheckpointsResponse {
    checkpoints: Vec<CheckpointItem>,
}

#[derive(Serialize)]
struct CheckpointItem {
    swap_id: String,
    owner: String,
    tag: String,
    created_at: String,
}

#[derive(Serialize)]
struct FundingResponse {
    waiting: Vec<FundingItem>,
}

#[derive(Serialize)]
struct FundingItem {
    swap_id: String,
    leg: String,
    address: String,
    amount: u64,
}
