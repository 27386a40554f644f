use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use df_core::validate::InstanceInput;
use uuid::Uuid;

use crate::auth::Owner;
use crate::dto::{ChangeStatusRequest, InstanceResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_instance(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    body: Result<Json<InstanceInput>, JsonRejection>,
) -> Result<(StatusCode, Json<InstanceResponse>), ApiError> {
    let Json(input) = body?;
    let instance = state.coordinator.create_instance(&owner.0, &input).await?;
    let resp = InstanceResponse::priced(&state.config.pricing, instance, Utc::now());
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn list_instances(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Json<Vec<InstanceResponse>>, ApiError> {
    let now = Utc::now();
    let instances = state.coordinator.list_instances(&owner.0).await?;
    Ok(Json(
        instances
            .into_iter()
            .map(|i| InstanceResponse::priced(&state.config.pricing, i, now))
            .collect(),
    ))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let instance = state.coordinator.get_instance(&owner.0, id).await?;
    Ok(Json(InstanceResponse::priced(
        &state.config.pricing,
        instance,
        Utc::now(),
    )))
}

pub async fn change_status(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
    body: Result<Json<ChangeStatusRequest>, JsonRejection>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let Json(req) = body?;
    let target = req.target()?;
    let instance = state.coordinator.change_status(&owner.0, id, target).await?;
    Ok(Json(InstanceResponse::priced(
        &state.config.pricing,
        instance,
        Utc::now(),
    )))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let instance = state.coordinator.delete_instance(&owner.0, id).await?;
    Ok(Json(InstanceResponse::priced(
        &state.config.pricing,
        instance,
        Utc::now(),
    )))
}
