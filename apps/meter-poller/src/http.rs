use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::model::HistoricalLogEntry;
use crate::observations::{Observations, SensorSnapshot};
use crate::store::HistoricalLog;

#[derive(Clone)]
pub struct HttpState {
    pub observations: Observations,
    pub log: Arc<dyn HistoricalLog>,
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    since: Option<DateTime<Utc>>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_sensors(State(state): State<HttpState>) -> Json<Vec<SensorSnapshot>> {
    Json(state.observations.all().await)
}

async fn get_historical(
    State(state): State<HttpState>,
    Query(query): Query<HistoricalQuery>,
) -> Json<Vec<HistoricalLogEntry>> {
    Json(state.log.entries_since(query.since))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sensors", get(get_sensors))
        .route("/v1/historical", get(get_historical))
        .with_state(state)
}
