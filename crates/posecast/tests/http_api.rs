//! Exercises the REST surface through the router, including real FK and VAE
//! sessions behind it.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use posecast::config::Config;
use posecast::server::{AppState, router};
use posecast::session::registry::SessionRegistry;

mod common;

struct TestApp {
  router: Router,
  _animations: tempfile::TempDir,
  _models: tempfile::TempDir,
}

fn test_app() -> TestApp {
  let animations = tempfile::tempdir().unwrap();
  common::write_chain_bvh(animations.path(), "walk.bvh", 3, 4);
  common::write_chain_bvh(animations.path(), "run.bvh", 3, 4);
  std::fs::write(animations.path().join("notes.txt"), "not a clip").unwrap();
  let models = tempfile::tempdir().unwrap();
  common::write_decoder_model(models.path(), "model.json");

  let config = Config {
    bind: "127.0.0.1:0".parse().unwrap(),
    animation_dir: animations.path().to_path_buf(),
    vae_dir: Some(models.path().to_path_buf()),
    fps: 60.0,
    buffer_count: 3,
  };
  let state = AppState {
    registry: Arc::new(SessionRegistry::new(common::session_opts())),
    config: Arc::new(config),
  };
  TestApp {
    router: router(state),
    _animations: animations,
    _models: models,
  }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
  let response = app.router.clone().oneshot(request).await.unwrap();
  let status = response.status();
  let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  let body = if bytes.is_empty() {
    Value::Null
  } else {
    serde_json::from_slice(&bytes).unwrap()
  };
  (status, body)
}

fn get(uri: &str) -> Request<Body> {
  Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
  Request::builder()
    .method("POST")
    .uri(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
  Request::builder()
    .method("DELETE")
    .uri(uri)
    .body(Body::empty())
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_only_bvh_animations() {
  let app = test_app();
  let (status, body) = send(&app, get("/animations")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["animations"], json!(["run.bvh", "walk.bvh"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_sessions_are_404_everywhere() {
  let app = test_app();
  for request in [
    get("/sessions/nope/skeleton"),
    get("/sessions/nope/info"),
    delete("/sessions/nope"),
    post("/sessions/nope/pause", json!({})),
    post("/sessions/nope/play", json!({})),
    post("/sessions/nope/speed", json!({"playback_speed": 1.0})),
    post("/sessions/nope/fps", json!({"fps": 30.0})),
    post("/sessions/nope/vae_values", json!({"vae_values": [0.0, 0.0, 0.0]})),
  ] {
    let uri = request.uri().clone();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "uri: {uri}");
    assert_eq!(body["detail"], "Session not found");
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_validates_kind_and_file_names() {
  let app = test_app();
  let (status, body) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "a", "session_type": "GAN", "animation_file": "walk.bvh"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(body["detail"].as_str().unwrap().contains("unknown session type"));

  let (status, _) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "a", "session_type": "FK", "animation_file": "../walk.bvh"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  // A missing clip surfaces the worker's message.
  let (status, body) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "a", "session_type": "FK", "animation_file": "missing.bvh"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body["detail"].as_str().unwrap().contains("missing.bvh"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fk_session_lifecycle_over_http() {
  let app = test_app();
  let (status, body) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "a", "session_type": "FK", "animation_file": "walk.bvh"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::OK, "create failed: {body}");
  assert_eq!(body["status"], "created");

  // Duplicate id conflicts.
  let (status, body) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "a", "session_type": "FK", "animation_file": "walk.bvh"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(body["detail"].as_str().unwrap().contains("already exists"));

  let (status, skeleton) = send(&app, get("/sessions/a/skeleton")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(skeleton["type"], "SKELETON_DEF");
  assert_eq!(skeleton["bone_names"].as_array().unwrap().len(), 3);
  assert_eq!(skeleton["parents"], json!([-1, 0, 1]));

  let (status, body) = send(
    &app,
    post("/sessions/a/speed", json!({"playback_speed": 2.0})),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["speed"], 2.0);

  let (status, info) = send(&app, get("/sessions/a/info")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(info["speed"], 2.0);

  let (status, _) = send(&app, post("/sessions/a/pause", json!({}))).await;
  assert_eq!(status, StatusCode::OK);
  let (status, _) = send(&app, post("/sessions/a/play", json!({}))).await;
  assert_eq!(status, StatusCode::OK);

  // FK animators reject latent updates with an engine error.
  let (status, body) = send(
    &app,
    post("/sessions/a/vae_values", json!({"vae_values": [0.1, 0.2, 0.3]})),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(body["detail"].as_str().unwrap().contains("unknown command"));

  let (status, body) = send(&app, delete("/sessions/a")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "deleted");
  let (status, _) = send(&app, get("/sessions/a/skeleton")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vae_session_accepts_latent_updates_over_http() {
  let app = test_app();
  let (status, body) = send(
    &app,
    post(
      "/sessions",
      json!({"session_id": "v", "session_type": "VAE", "animation_file": "model.json"}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::OK, "create failed: {body}");

  let (status, body) = send(
    &app,
    post("/sessions/v/vae_values", json!({"vae_values": [0.5, -0.5, 0.25]})),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["vae_values"], json!([0.5, -0.5, 0.25]));

  // Arity is validated before dispatch.
  let (status, _) = send(
    &app,
    post("/sessions/v/vae_values", json!({"vae_values": [0.5]})),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _) = send(&app, delete("/sessions/v")).await;
  assert_eq!(status, StatusCode::OK);
}
