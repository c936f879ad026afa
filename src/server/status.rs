//! Monitoring endpoints: health, status snapshot, model listing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::health::HealthState;
use crate::Gateway;

#[derive(Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

pub async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let report = gateway.health_report().await;
    let status = match report.state {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

pub async fn status(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(gateway.status()).into_response()
}

pub async fn list_models(State(gateway): State<Arc<Gateway>>) -> Json<ModelsResponse> {
    let mut data: Vec<ModelObject> = gateway
        .catalog()
        .list()
        .iter()
        .map(|d| ModelObject {
            id: d.name.clone(),
            object: "model",
            owned_by: "user",
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
