//! Thin HTTP control surface: read the tracked pair set and its
//! lifecycle state, and drive start/stop transitions. No business logic
//! lives here beyond request parsing and status mapping; everything else
//! delegates to `Repository`/`DataCollector`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::collector::DataCollector;
use crate::pair::{Pair, PairChange, PairQuery, PairStatus};
use crate::pair_manager::PairManager;
use crate::repository::Repository;

/// Process-local wall-clock time, falling back to UTC if the OS offset
/// can't be determined.
fn local_now() -> time::OffsetDateTime {
    time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc())
}

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<Repository>,
    pub collector: Arc<DataCollector>,
    pub pair_manager: Arc<PairManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/currency_pairs", get(list_currency_pairs))
        .route("/currency_pairs/:uuid", get(get_currency_pair))
        .route("/currency_pairs/:uuid/start", post(start_currency_pair))
        .route("/currency_pairs/:uuid/stop", post(stop_currency_pair))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct IndexResponse {
    #[serde(with = "time::serde::rfc3339")]
    time: time::OffsetDateTime,
    timezone: String,
    #[serde(with = "time::serde::rfc3339::option")]
    last_update_dt: Option<time::OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_change_dt: Option<time::OffsetDateTime>,
    last_change: Option<PairChange>,
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let now = local_now();
    Json(IndexResponse {
        timezone: now.offset().to_string(),
        time: now,
        last_update_dt: state.pair_manager.last_update_dt(),
        last_change_dt: state.pair_manager.last_change_dt(),
        last_change: state.pair_manager.last_change(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "OK" })
}

#[derive(Deserialize, Default)]
struct CurrencyPairFilter {
    base: Option<String>,
    quote: Option<String>,
    status: Option<PairStatus>,
}

async fn list_currency_pairs(
    State(state): State<AppState>,
    Query(filter): Query<CurrencyPairFilter>,
) -> impl IntoResponse {
    let query = PairQuery {
        base: filter.base,
        quote: filter.quote,
        status: filter.status,
    };
    Json(state.repository.find(&query))
}

async fn get_currency_pair(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.repository.read(uuid) {
        Ok(pair) => Json(pair).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_currency_pair(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let pair = match state.repository.read(uuid) {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if matches!(
        pair.status,
        PairStatus::Archived | PairStatus::Active | PairStatus::Idle
    ) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut started = pair.clone();
    started.status = PairStatus::Active;
    if let Err(e) = transition(&state, uuid, started) {
        return e;
    }
    if let Err(e) = state.collector.add_currency_pair(pair) {
        log::warn!("could not start collecting: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn stop_currency_pair(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let pair = match state.repository.read(uuid) {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if !matches!(pair.status, PairStatus::Active | PairStatus::Idle) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut stopped = pair.clone();
    stopped.status = PairStatus::Stopped;
    if let Err(e) = transition(&state, uuid, stopped) {
        return e;
    }
    if let Err(e) = state.collector.remove_currency_pair(pair) {
        log::warn!("could not stop collecting: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

fn transition(
    state: &AppState,
    uuid: Uuid,
    pair: Pair,
) -> std::result::Result<(), axum::response::Response> {
    state.repository.update(uuid, pair).map(|_| ()).map_err(|e| {
        log::warn!("could not persist pair transition: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}
