use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/market-context", post(generate_market_context))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Deserialize)]
struct PeriodQuery {
    period: String,
}

#[derive(Serialize)]
struct MarketContextResponse {
    formatted_context: String,
    period: String,
}

async fn generate_market_context(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let period = query.period;
    if !is_valid_period(&period) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid period format, expected YYYY-QX, got: {period}"),
        );
    }

    info!("generating market context for period {period}");
    match state.pipeline.run(&period).await {
        Ok(formatted_context) => {
            info!("successfully generated market context for {period}");
            Json(MarketContextResponse {
                formatted_context,
                period,
            })
            .into_response()
        }
        Err(e @ Error::Validation(_)) => {
            error!("validation error for {period}: {e}");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!("error generating market context for {period}: {e}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {e}"),
            )
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let vector_store = if state.pipeline.store().is_indexed().await {
        "available"
    } else {
        "not_indexed"
    };

    Json(json!({
        "status": "healthy",
        "service": "market-context-generator",
        "vector_store": vector_store,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Read-only rate limiter counters for operational visibility.
async fn status(State(state): State<AppState>) -> Response {
    Json(state.limiter.status().await).into_response()
}

fn error_response(code: StatusCode, detail: String) -> Response {
    (code, Json(json!({ "detail": detail }))).into_response()
}

/// Periods look like "2025-Q2".
fn is_valid_period(period: &str) -> bool {
    let bytes = period.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(|b| b.is_ascii_digit())
        && &period[4..6] == "-Q"
        && matches!(bytes[6], b'1'..=b'4')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_periods() {
        for period in ["2025-Q1", "2025-Q2", "1999-Q4", "2030-Q3"] {
            assert!(is_valid_period(period), "{period} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_periods() {
        for period in [
            "2025Q2", "2025-Q5", "2025-Q0", "25-Q1", "2025-q2", "2025-Q22", "", "Q2-2025",
        ] {
            assert!(!is_valid_period(period), "{period} should be invalid");
        }
    }
}
