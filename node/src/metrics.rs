//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics` on the metrics
//! listener. Gauges that mirror ledger state are refreshed from the
//! generator on every scrape; counters are bumped by the API handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::api::AppState;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Latest committed block height.
    pub block_height: IntGauge,
    /// Transactions waiting for the next cycle.
    pub pool_transactions: IntGauge,
    /// Committed unspent outputs.
    pub utxos: IntGauge,
    pub transactions_submitted_total: IntCounter,
    pub transactions_rejected_total: IntCounter,
    /// Sign-block requests this node answered with a signature.
    pub blocks_signed_total: IntCounter,
    pub sign_requests_refused_total: IntCounter,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("quorum".into()), None)?;

        let block_height = IntGauge::new("block_height", "Height of the latest committed block")?;
        let pool_transactions =
            IntGauge::new("pool_transactions", "Transactions waiting in the pool")?;
        let utxos = IntGauge::new("utxos", "Committed unspent outputs")?;
        let transactions_submitted_total = IntCounter::new(
            "transactions_submitted_total",
            "Transactions accepted into the pool",
        )?;
        let transactions_rejected_total = IntCounter::new(
            "transactions_rejected_total",
            "Transactions refused at submission",
        )?;
        let blocks_signed_total =
            IntCounter::new("blocks_signed_total", "Blocks signed for a generator")?;
        let sign_requests_refused_total = IntCounter::new(
            "sign_requests_refused_total",
            "Sign-block requests refused",
        )?;

        registry.register(Box::new(block_height.clone()))?;
        registry.register(Box::new(pool_transactions.clone()))?;
        registry.register(Box::new(utxos.clone()))?;
        registry.register(Box::new(transactions_submitted_total.clone()))?;
        registry.register(Box::new(transactions_rejected_total.clone()))?;
        registry.register(Box::new(blocks_signed_total.clone()))?;
        registry.register(Box::new(sign_requests_refused_total.clone()))?;

        Ok(Self {
            registry,
            block_height,
            pool_transactions,
            utxos,
            transactions_submitted_total,
            transactions_rejected_total,
            blocks_signed_total,
            sign_requests_refused_total,
        })
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.metrics;
    metrics
        .block_height
        .set(state.generator.latest_height().unwrap_or(0) as i64);
    metrics
        .pool_transactions
        .set(state.generator.pool_len() as i64);
    metrics.utxos.set(state.generator.db().utxo_count() as i64);

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
