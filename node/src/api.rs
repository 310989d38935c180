//! # HTTP API
//!
//! Builds the axum router for the node's HTTP interface. All handlers share
//! [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                      | Description                          |
//! |--------|---------------------------|--------------------------------------|
//! | GET    | `/health`                 | Liveness check                       |
//! | GET    | `/status`                 | Chain tip and pool summary           |
//! | POST   | `/submit`                 | Submit a transaction to the pool     |
//! | GET    | `/blocks?after=N`         | Committed blocks above height N      |
//! | POST   | `/rpc/signer/sign-block`  | Sign a candidate block (signer key)  |

use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use quorum_ledger::config::SIGNER_RPC_PATH;
use quorum_ledger::generator::{LocalSigner, SignBlockRequest, SignBlockResponse, SignerError};
use quorum_ledger::storage::Block;
use quorum_ledger::transaction::Transaction;
use quorum_ledger::{Generator, GeneratorError};

use crate::metrics::NodeMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub generator: Arc<Generator>,
    /// This node's own key, when it signs for generators.
    pub signer: Option<Arc<LocalSigner>>,
    pub metrics: Arc<NodeMetrics>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/submit", post(submit_handler))
        .route("/blocks", get(blocks_handler))
        .route(SIGNER_RPC_PATH, post(sign_block_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    /// `None` until the chain is initialized.
    pub height: Option<u64>,
    pub block_hash: Option<String>,
    pub state_root: Option<String>,
    pub quorum: Option<u32>,
    pub pool_size: usize,
    pub signs_blocks: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub tx_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct BlocksQuery {
    #[serde(default)]
    pub after: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let latest = state.generator.latest_block();
    Json(StatusResponse {
        version: state.version.clone(),
        height: latest.as_ref().map(|b| b.height()),
        block_hash: latest.as_ref().map(|b| b.hash_hex()),
        state_root: state.generator.state_root().map(hex::encode),
        quorum: latest.as_ref().map(|b| b.header.consensus_program.quorum),
        pool_size: state.generator.pool_len(),
        signs_blocks: state.signer.is_some(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `POST /submit` — accept a transaction into the pool.
///
/// 202 on acceptance, 422 when the transaction conflicts with the pool or
/// spends an unknown output.
async fn submit_handler(State(state): State<AppState>, Json(tx): Json<Transaction>) -> Response {
    match state.generator.submit(tx) {
        Ok(hash) => {
            state.metrics.transactions_submitted_total.inc();
            (
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    tx_hash: hex::encode(hash),
                }),
            )
                .into_response()
        }
        Err(GeneratorError::Rejected(reason)) => {
            state.metrics.transactions_rejected_total.inc();
            error_response(StatusCode::UNPROCESSABLE_ENTITY, reason)
        }
        Err(e) => {
            warn!(error = %e, "submit failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// `GET /blocks?after=N` — committed blocks above `N`, oldest first.
async fn blocks_handler(
    State(state): State<AppState>,
    Query(query): Query<BlocksQuery>,
) -> Response {
    match state.generator.get_blocks(query.after).await {
        Ok(blocks) => {
            let blocks: Vec<&Block> = blocks.iter().map(AsRef::as_ref).collect();
            Json(blocks).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `POST /rpc/signer/sign-block` — sign a generator's candidate block.
///
/// 404 when this node holds no signing key, 409 on a conflicting block at
/// an already-signed height, 400 on a malformed block.
async fn sign_block_handler(
    State(state): State<AppState>,
    Json(req): Json<SignBlockRequest>,
) -> Response {
    let Some(signer) = &state.signer else {
        return error_response(StatusCode::NOT_FOUND, "this node does not sign blocks");
    };

    match signer.sign(&req.block) {
        Ok(signature) => {
            state.metrics.blocks_signed_total.inc();
            info!(height = req.block.height(), "signed block for generator");
            Json(SignBlockResponse {
                signature: signature.to_hex(),
            })
            .into_response()
        }
        Err(e) => {
            state.metrics.sign_requests_refused_total.inc();
            warn!(height = req.block.height(), error = %e, "sign request refused");
            let status = match e {
                SignerError::Equivocation { .. } => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            error_response(status, e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
