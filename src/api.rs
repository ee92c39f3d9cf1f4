use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::db::Store;
use crate::models::MonthlyAggregateRecord;

#[derive(Debug, Deserialize)]
pub struct MonthlyQuery {
    pub period: Option<String>, // "YYYY.MM"
    pub address: Option<String>,
    pub limit: Option<u32>, // defaults to 100
}

type ApiError = (StatusCode, String);

pub fn router(store: Store) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Delegator stats API running" }))
        .route("/delegators/monthly", get(get_monthly))
        .layer(cors)
        .with_state(store)
}

pub async fn serve(port: u16, store: Store) -> eyre::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(store).into_make_service()).await?;

    Ok(())
}

// ---------- DB wrapper (spawn_blocking) ----------

async fn get_monthly(
    State(store): State<Store>,
    Query(q): Query<MonthlyQuery>,
) -> Result<Json<Vec<MonthlyAggregateRecord>>, ApiError> {
    let limit = q.limit.unwrap_or(100).min(1000);
    let records = task::spawn_blocking(move || {
        store.query_monthly_records(q.period.as_deref(), q.address.as_deref(), limit)
    })
    .await
    .map_err(|e| internal(e.to_string()))?
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(records))
}

fn internal(msg: String) -> ApiError {
    error!("API query failed: {}", msg);
    (StatusCode::INTERNAL_SERVER_ERROR, msg)
}
