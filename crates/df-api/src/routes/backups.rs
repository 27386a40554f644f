use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use df_core::validate::{BackupInput, RestoreInput};
use df_db::models::LeakedResource;
use uuid::Uuid;

use crate::auth::Owner;
use crate::dto::{BackupResponse, InstanceResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_backup(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    body: Result<Json<BackupInput>, JsonRejection>,
) -> Result<(StatusCode, Json<BackupResponse>), ApiError> {
    let Json(input) = body?;
    let backup = state.coordinator.create_backup(&owner.0, &input).await?;
    let resp = BackupResponse::priced(&state.config.pricing, backup, Utc::now());
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn list_backups(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Json<Vec<BackupResponse>>, ApiError> {
    let now = Utc::now();
    let backups = state.coordinator.list_backups(&owner.0).await?;
    Ok(Json(
        backups
            .into_iter()
            .map(|b| BackupResponse::priced(&state.config.pricing, b, now))
            .collect(),
    ))
}

pub async fn get_backup(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupResponse>, ApiError> {
    let backup = state.coordinator.get_backup(&owner.0, id).await?;
    Ok(Json(BackupResponse::priced(
        &state.config.pricing,
        backup,
        Utc::now(),
    )))
}

pub async fn delete_backup(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupResponse>, ApiError> {
    let backup = state.coordinator.delete_backup(&owner.0, id).await?;
    Ok(Json(BackupResponse::priced(
        &state.config.pricing,
        backup,
        Utc::now(),
    )))
}

pub async fn restore_backup(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<Uuid>,
    body: Result<Json<RestoreInput>, JsonRejection>,
) -> Result<(StatusCode, Json<InstanceResponse>), ApiError> {
    let Json(input) = body?;
    let instance = state.coordinator.restore_backup(&owner.0, id, &input).await?;
    let resp = InstanceResponse::priced(&state.config.pricing, instance, Utc::now());
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn list_leaked_resources(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Json<Vec<LeakedResource>>, ApiError> {
    Ok(Json(state.coordinator.leaked_resources(&owner.0).await?))
}
