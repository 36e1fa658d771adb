//! REST control surface for session lifecycle and playback.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::animator::AnimatorKind;
use crate::session::Session;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
  pub session_id: String,
  #[serde(default = "default_session_type")]
  pub session_type: String,
  pub animation_file: String,
}

fn default_session_type() -> String {
  "FK".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SpeedRequest {
  pub playback_speed: f64,
}

#[derive(Debug, Deserialize)]
pub struct FpsRequest {
  pub fps: f64,
}

#[derive(Debug, Deserialize)]
pub struct VaeValuesRequest {
  pub vae_values: Vec<f64>,
}

async fn lookup(state: &AppState, id: &str) -> Result<Arc<Session>, ApiError> {
  state.registry.get(id).await.ok_or(ApiError::NotFound)
}

/// `GET /animations`: BVH files available for FK sessions.
pub async fn list_animations(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
  let mut entries = tokio::fs::read_dir(&state.config.animation_dir)
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;
  let mut animations = Vec::new();
  while let Some(entry) = entries
    .next_entry()
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?
  {
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if FsPath::new(name.as_ref())
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("bvh"))
    {
      animations.push(name.into_owned());
    }
  }
  animations.sort();
  Ok(Json(json!({ "animations": animations })))
}

/// `POST /sessions`: create a session and run its start handshake.
pub async fn create_session(
  State(state): State<AppState>,
  Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
  let kind: AnimatorKind = req.session_type.parse().map_err(ApiError::BadRequest)?;
  if req.session_id.is_empty() {
    return Err(ApiError::BadRequest("session_id must not be empty".to_string()));
  }
  if req.animation_file.is_empty() || req.animation_file.contains(['/', '\\']) {
    return Err(ApiError::BadRequest(format!(
      "invalid animation file name: {}",
      req.animation_file
    )));
  }
  let source = match kind {
    AnimatorKind::Fk => state.config.animation_dir.join(&req.animation_file),
    AnimatorKind::Vae => state
      .config
      .vae_dir
      .as_ref()
      .ok_or_else(|| ApiError::BadRequest("VAE_DIR is not configured".to_string()))?
      .join(&req.animation_file),
  };

  let session = state.registry.create(&req.session_id, kind, source).await?;
  if let Err(err) = session.start().await {
    // The failed session is discarded, freeing its id for a retry.
    let _ = state.registry.remove(&req.session_id).await;
    session.stop().await;
    return Err(err.into());
  }
  Ok(Json(
    json!({ "status": "created", "session_id": req.session_id }),
  ))
}

/// `GET /sessions/{id}/skeleton`: discovery document for the 3D client.
pub async fn get_skeleton(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
  let session = lookup(&state, &id).await?;
  let skeleton = session.skeleton().ok_or(ApiError::NotFound)?;
  Ok(Json(serde_json::to_value(skeleton).map_err(|err| {
    ApiError::Internal(err.to_string())
  })?))
}

/// `GET /sessions/{id}/info`: live engine state straight from the worker.
pub async fn get_info(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
  let session = lookup(&state, &id).await?;
  Ok(Json(session.get_info().await?))
}

/// `DELETE /sessions/{id}`: stop the session and release its resources.
pub async fn delete_session(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
  state.registry.delete(&id).await?;
  Ok(Json(json!({ "status": "deleted", "session_id": id })))
}

pub async fn pause_session(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
  let session = lookup(&state, &id).await?;
  session.pause().await?;
  Ok(Json(json!({ "status": "paused", "session_id": id })))
}

pub async fn play_session(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
  let session = lookup(&state, &id).await?;
  session.play().await?;
  Ok(Json(json!({ "status": "playing", "session_id": id })))
}

pub async fn set_speed(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(req): Json<SpeedRequest>,
) -> Result<Json<Value>, ApiError> {
  if !req.playback_speed.is_finite() {
    return Err(ApiError::BadRequest("playback_speed must be finite".to_string()));
  }
  let session = lookup(&state, &id).await?;
  session.set_speed(req.playback_speed).await?;
  Ok(Json(json!({
    "status": "updated",
    "session_id": id,
    "speed": req.playback_speed,
  })))
}

pub async fn set_fps(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(req): Json<FpsRequest>,
) -> Result<Json<Value>, ApiError> {
  let session = lookup(&state, &id).await?;
  session.set_fps(req.fps).await?;
  Ok(Json(json!({
    "status": "updated",
    "session_id": id,
    "fps": req.fps,
  })))
}

/// `POST /sessions/{id}/vae_values`: only meaningful for VAE sessions; any
/// other kind gets the worker's engine error back.
pub async fn set_vae_values(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(req): Json<VaeValuesRequest>,
) -> Result<Json<Value>, ApiError> {
  if req.vae_values.len() != 3 || req.vae_values.iter().any(|v| !v.is_finite()) {
    return Err(ApiError::BadRequest(
      "vae_values must be exactly 3 finite numbers".to_string(),
    ));
  }
  let session = lookup(&state, &id).await?;
  session.set_vae_values(&req.vae_values).await?;
  Ok(Json(json!({
    "status": "updated",
    "session_id": id,
    "vae_values": req.vae_values,
  })))
}
