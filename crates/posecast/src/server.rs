//! HTTP + WebSocket control and streaming surface.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::{RegistryError, SessionError};
use crate::session::SessionOptions;
use crate::session::registry::SessionRegistry;

pub mod routes;
pub mod ws;

#[derive(Clone)]
pub struct AppState {
  pub registry: Arc<SessionRegistry>,
  pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/animations", get(routes::list_animations))
    .route("/sessions", post(routes::create_session))
    .route("/sessions/:id", delete(routes::delete_session))
    .route("/sessions/:id/skeleton", get(routes::get_skeleton))
    .route("/sessions/:id/info", get(routes::get_info))
    .route("/sessions/:id/pause", post(routes::pause_session))
    .route("/sessions/:id/play", post(routes::play_session))
    .route("/sessions/:id/speed", post(routes::set_speed))
    .route("/sessions/:id/fps", post(routes::set_fps))
    .route("/sessions/:id/vae_values", post(routes::set_vae_values))
    .route("/ws/:id", get(ws::subscribe))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}

/// Run the server until ctrl-c, then delete every session in parallel.
pub async fn serve(config: Config) -> anyhow::Result<()> {
  let registry = Arc::new(SessionRegistry::new(SessionOptions {
    buffer_count: config.buffer_count,
    fps: config.fps,
    worker_bin: None,
  }));
  let state = AppState {
    registry: Arc::clone(&registry),
    config: Arc::new(config.clone()),
  };

  let listener = tokio::net::TcpListener::bind(config.bind).await?;
  info!(
    event = "server_started",
    bind = %config.bind,
    animation_dir = %config.animation_dir.display(),
  );
  axum::serve(listener, router(state))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!(event = "server_shutdown_requested");
    })
    .await?;

  registry.shutdown().await;
  info!(event = "server_stopped");
  Ok(())
}

/// HTTP mapping of the error taxonomy. Bodies are `{"detail": message}`.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),
  #[error("Session not found")]
  NotFound,
  #[error("{0}")]
  Engine(String),
  #[error("worker did not reply in time")]
  DispatchTimeout,
  #[error("worker channel broken; delete the session")]
  BrokenChannel,
  #[error("{0}")]
  Internal(String),
}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      Self::BadRequest(_) | Self::Engine(_) => StatusCode::BAD_REQUEST,
      Self::NotFound => StatusCode::NOT_FOUND,
      Self::DispatchTimeout => StatusCode::GATEWAY_TIMEOUT,
      Self::BrokenChannel => StatusCode::BAD_GATEWAY,
      Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let body = axum::Json(json!({ "detail": self.to_string() }));
    (self.status(), body).into_response()
  }
}

impl From<SessionError> for ApiError {
  fn from(err: SessionError) -> Self {
    match err {
      SessionError::Engine(message) => Self::Engine(message),
      SessionError::DispatchTimeout => Self::DispatchTimeout,
      SessionError::BrokenChannel => Self::BrokenChannel,
      // A stopped or half-started session is indistinguishable from a
      // missing one for callers.
      SessionError::NotStarted => Self::NotFound,
      SessionError::Init(message) => Self::Internal(message),
      SessionError::HandshakeTimeout => Self::Internal(err.to_string()),
      SessionError::Io(io) => Self::Internal(io.to_string()),
    }
  }
}

impl From<RegistryError> for ApiError {
  fn from(err: RegistryError) -> Self {
    match err {
      RegistryError::Conflict(_) => Self::BadRequest(err.to_string()),
      RegistryError::NotFound(_) => Self::NotFound,
      RegistryError::Session(inner) => inner.into(),
      RegistryError::Io(io) => Self::Internal(io.to_string()),
    }
  }
}
