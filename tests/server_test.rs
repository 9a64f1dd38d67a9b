// 该文件是 Anfang （安防） 项目的一部分。
// tests/server_test.rs - HTTP 接口测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anfang::{
  config::{ConfidenceThreshold, Settings},
  frame::{ChannelOrder, Frame},
  input::{BoxedCamera, CameraError, CameraOpener},
  model::{DetectItem, DetectResult, InferenceError, Model, ModelError},
  server::{AppState, router, spawn_session_reaper},
  session::SessionMode,
};
use axum::{
  body::{Body, Bytes},
  http::{HeaderMap, Request, StatusCode, header},
};
use image::{ImageFormat, RgbImage};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "anfang-test-boundary";

struct StubModel;

impl Model for StubModel {
  fn name(&self) -> &str {
    "stub"
  }

  fn channel_order(&self) -> ChannelOrder {
    ChannelOrder::Bgr
  }

  fn infer(
    &self,
    _: &Frame,
    threshold: ConfidenceThreshold,
  ) -> Result<DetectResult, InferenceError> {
    let items = [0.3, 0.8]
      .into_iter()
      .filter(|score| *score >= threshold.value())
      .map(|score| DetectItem {
        class_id: 1,
        class_name: "hairnet".into(),
        score,
        bbox: [0.2, 0.2, 0.6, 0.7],
      })
      .collect::<Vec<_>>();
    Ok(DetectResult::from(items))
  }
}

struct FakeCamera {
  frames: usize,
  available: bool,
}

impl CameraOpener for FakeCamera {
  fn open(&self) -> Result<BoxedCamera, CameraError> {
    if !self.available {
      return Err(CameraError::Unavailable {
        device: "/dev/video0".into(),
        reason: "device busy".into(),
      });
    }
    let frames = (0..self.frames).map(|_| Ok::<_, CameraError>(Frame::from(RgbImage::new(32, 24))));
    Ok(Box::new(frames))
  }

  fn describe(&self) -> String {
    "fake://camera".into()
  }
}

struct Fixture {
  state: AppState,
  loads: Arc<AtomicUsize>,
  _dir: TempDir,
}

fn fixture(camera: FakeCamera) -> Fixture {
  fixture_with(camera, Settings::default())
}

fn fixture_with(camera: FakeCamera, settings: Settings) -> Fixture {
  let dir = tempfile::tempdir().unwrap();
  // 只提供 nano 权重，small 权重缺失
  std::fs::write(dir.path().join("best_yolo11n.pt"), b"weights").unwrap();

  let settings = Settings {
    model_dir: Some(dir.path().to_path_buf()),
    ..settings
  };

  let loads = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&loads);
  let factory = move |_: &Path| -> Result<Arc<dyn Model>, ModelError> {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(Arc::new(StubModel))
  };

  let state = AppState::new(&settings, factory, Arc::new(camera)).unwrap();
  Fixture {
    state,
    loads,
    _dir: dir,
  }
}

fn default_fixture() -> Fixture {
  fixture(FakeCamera {
    frames: 3,
    available: true,
  })
}

async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
  let response = router(state.clone()).oneshot(request).await.unwrap();
  let status = response.status();
  let headers = response.headers().clone();
  let body = axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  (status, headers, body)
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
  call(state, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_empty(state: &AppState, uri: &str) -> (StatusCode, Value) {
  let (status, _, body) = call(state, Request::post(uri).body(Body::empty()).unwrap()).await;
  (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post_json(state: &AppState, uri: &str, value: Value) -> (StatusCode, Value) {
  let request = Request::post(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(value.to_string()))
    .unwrap();
  let (status, _, body) = call(state, request).await;
  (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn encoded(format: ImageFormat) -> Vec<u8> {
  let mut bytes = Vec::new();
  RgbImage::new(64, 48)
    .write_to(&mut Cursor::new(&mut bytes), format)
    .unwrap();
  bytes
}

fn detect_request(model: &str, confidence: &str, file_name: &str, image: &[u8]) -> Request<Body> {
  let mut body = Vec::new();
  for (name, value) in [("model", model), ("confidence", confidence)] {
    body.extend_from_slice(
      format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
      )
      .as_bytes(),
    );
  }
  body.extend_from_slice(
    format!(
      "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .as_bytes(),
  );
  body.extend_from_slice(image);
  body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

  Request::post("/api/detect")
    .header(
      header::CONTENT_TYPE,
      format!("multipart/form-data; boundary={BOUNDARY}"),
    )
    .body(Body::from(body))
    .unwrap()
}

async fn create_session(state: &AppState) -> String {
  let (status, body) = post_empty(state, "/api/sessions").await;
  assert_eq!(status, StatusCode::CREATED);
  body["id"].as_str().unwrap().to_string()
}

async fn status_of(state: &AppState, id: &str) -> Value {
  let (status, _, body) = get(state, &format!("/api/sessions/{id}/status")).await;
  assert_eq!(status, StatusCode::OK);
  serde_json::from_slice(&body).unwrap()
}

/// 等待采集线程结束，返回此时的状态
async fn wait_for_loop_exit(state: &AppState, id: &str) -> Value {
  for _ in 0..200 {
    let status = status_of(state, id).await;
    if status["loop_active"] == false {
      return status;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  panic!("capture loop never finished");
}

#[tokio::test]
async fn page_and_health_are_served() {
  let fx = default_fixture();

  let (status, _, body) = get(&fx.state, "/healthz").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(&body[..], b"ok");

  let (status, headers, body) = get(&fx.state, "/").await;
  assert_eq!(status, StatusCode::OK);
  assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
  assert!(String::from_utf8_lossy(&body).contains("Run detection"));
}

#[tokio::test]
async fn options_list_models_and_slider_range() {
  let fx = default_fixture();
  let (status, _, body) = get(&fx.state, "/api/options").await;
  assert_eq!(status, StatusCode::OK);

  let options: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(options["models"], json!(["YOLO11n (nano)", "YOLO11s (small)"]));
  assert_eq!(options["default_model"], "YOLO11n (nano)");
  let confidence = &options["confidence"];
  assert!((confidence["min"].as_f64().unwrap() - 0.01).abs() < 1e-6);
  assert!((confidence["max"].as_f64().unwrap() - 1.0).abs() < 1e-6);
  assert!((confidence["default"].as_f64().unwrap() - 0.25).abs() < 1e-6);
}

#[tokio::test]
async fn detect_returns_annotated_png() {
  let fx = default_fixture();
  let request = detect_request("YOLO11n (nano)", "0.25", "line.jpg", &encoded(ImageFormat::Jpeg));
  let (status, headers, body) = call(&fx.state, request).await;

  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers[header::CONTENT_TYPE], "image/png");
  assert_eq!(headers["x-anfang-detections"], "2");
  assert_eq!(headers["x-anfang-model"], "YOLO11n (nano)");
  let annotated = image::load_from_memory(&body).unwrap();
  assert_eq!((annotated.width(), annotated.height()), (64, 48));
}

#[tokio::test]
async fn detect_applies_threshold_and_loads_model_once() {
  let fx = default_fixture();
  for _ in 0..2 {
    let request = detect_request("YOLO11n (nano)", "0.5", "line.png", &encoded(ImageFormat::Png));
    let (status, headers, _) = call(&fx.state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-anfang-detections"], "1");
  }
  assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn detect_rejects_unsupported_upload() {
  let fx = default_fixture();
  let request = detect_request("YOLO11n (nano)", "0.25", "line.bmp", &encoded(ImageFormat::Png));
  let (status, _, body) = call(&fx.state, request).await;
  assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
  let error: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(error["code"], "unsupported_format");

  // 扩展名合法但内容不是图片
  let request = detect_request("YOLO11n (nano)", "0.25", "line.png", b"GIF89a not really");
  let (status, _, _) = call(&fx.state, request).await;
  assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn detect_reports_configuration_errors() {
  let fx = default_fixture();
  let png = encoded(ImageFormat::Png);

  let (status, _, body) = call(&fx.state, detect_request("YOLO11x", "0.25", "a.png", &png)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  let error: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(error["code"], "configuration_error");

  for confidence in ["0", "1.5", "abc"] {
    let request = detect_request("YOLO11n (nano)", confidence, "a.png", &png);
    let (status, _, _) = call(&fx.state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "confidence {confidence}");
  }
}

#[tokio::test]
async fn missing_weights_are_not_found() {
  let fx = default_fixture();
  let request = detect_request("YOLO11s (small)", "0.25", "a.png", &encoded(ImageFormat::Png));
  let (status, _, body) = call(&fx.state, request).await;

  assert_eq!(status, StatusCode::NOT_FOUND);
  let error: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(error["code"], "resource_not_found");
  assert_eq!(fx.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn webcam_session_renders_until_stream_ends() {
  let fx = default_fixture();
  let id = create_session(&fx.state).await;

  let (status, _, _) = get(&fx.state, &format!("/api/sessions/{id}/frame")).await;
  assert_eq!(status, StatusCode::NO_CONTENT);

  let (status, body) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["model"], "YOLO11n (nano)");
  assert_eq!(body["loop_active"], true);

  let status = wait_for_loop_exit(&fx.state, &id).await;
  assert_eq!(status["notice"]["message"], "Webcam stopped");
  assert_eq!(status["mode"], "stopped");
  assert_eq!(status["frames"], 3);
  assert_eq!(status["detections"], 2);

  let (status, headers, body) = get(&fx.state, &format!("/api/sessions/{id}/frame")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
  assert_eq!(headers["x-anfang-frame"], "3");
  assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Jpeg);
}

#[tokio::test]
async fn webcam_stop_is_idempotent() {
  let fx = fixture(FakeCamera {
    frames: usize::MAX,
    available: true,
  });
  let id = create_session(&fx.state).await;

  let (status, _) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/stop")).await;
  assert_eq!(status, StatusCode::OK);

  let (status, _) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::OK);
  let (status, body) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["mode"], "running");

  for _ in 0..2 {
    let (status, body) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "stopped");
  }

  let status = wait_for_loop_exit(&fx.state, &id).await;
  assert_eq!(status["mode"], "stopped");
  assert_eq!(status["notice"]["message"], "Webcam stopped");
  assert!(status["frames"].as_u64().unwrap() >= 1);
  assert_eq!(fx.loads.load(Ordering::SeqCst), 1);

  // 循环退出后的最后一帧仍可读取
  let (status, headers, _) = get(&fx.state, &format!("/api/sessions/{id}/frame")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers["x-anfang-frame"], status_of(&fx.state, &id).await["frames"].to_string());
}

#[tokio::test]
async fn unavailable_camera_is_reported() {
  let fx = fixture(FakeCamera {
    frames: 0,
    available: false,
  });
  let id = create_session(&fx.state).await;

  let (status, body) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(body["code"], "camera_unavailable");

  let status = status_of(&fx.state, &id).await;
  assert_eq!(status["mode"], "stopped");
  assert_eq!(status["notice"]["level"], "error");
}

#[tokio::test]
async fn camera_without_frames_reports_error_notice() {
  let fx = fixture(FakeCamera {
    frames: 0,
    available: true,
  });
  let id = create_session(&fx.state).await;

  let (status, _) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::OK);

  let status = wait_for_loop_exit(&fx.state, &id).await;
  assert_eq!(status["notice"]["level"], "error");
  assert_eq!(status["mode"], "stopped");
  assert_eq!(status["frames"], 0);
}

#[tokio::test]
async fn abandoned_session_is_reaped() {
  let fx = fixture_with(
    FakeCamera {
      frames: usize::MAX,
      available: true,
    },
    Settings {
      session_idle_ms: 200,
      ..Settings::default()
    },
  );
  let id = create_session(&fx.state).await;
  let (status, _) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::OK);

  let session = fx.state.sessions().get(Uuid::parse_str(&id).unwrap()).unwrap();
  let reaper = spawn_session_reaper(fx.state.clone());

  // 页面不再发送任何请求
  for _ in 0..200 {
    if !session.is_capturing() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  reaper.abort();

  assert!(!session.is_capturing());
  assert!(!session.state.has_loop());
  assert_eq!(session.state.mode(), SessionMode::Stopped);
  assert!(session.display.frames() >= 1);
  assert!(fx.state.sessions().is_empty());

  let (status, _, _) = get(&fx.state, &format!("/api/sessions/{id}/status")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn polled_session_is_kept() {
  let fx = fixture_with(
    FakeCamera {
      frames: 0,
      available: true,
    },
    Settings {
      session_idle_ms: 200,
      ..Settings::default()
    },
  );
  let id = create_session(&fx.state).await;
  let reaper = spawn_session_reaper(fx.state.clone());

  for _ in 0..8 {
    tokio::time::sleep(Duration::from_millis(75)).await;
    status_of(&fx.state, &id).await;
  }
  reaper.abort();
  assert_eq!(fx.state.sessions().len(), 1);
}

#[tokio::test]
async fn start_with_missing_weights_keeps_session_stopped() {
  let fx = default_fixture();
  let id = create_session(&fx.state).await;

  let (status, _) = post_json(
    &fx.state,
    &format!("/api/sessions/{id}/settings"),
    json!({ "model": "YOLO11s (small)" }),
  )
  .await;
  assert_eq!(status, StatusCode::OK);

  let (status, body) = post_empty(&fx.state, &format!("/api/sessions/{id}/webcam/start")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(body["code"], "resource_not_found");
  assert_eq!(status_of(&fx.state, &id).await["mode"], "stopped");
}

#[tokio::test]
async fn settings_are_validated() {
  let fx = default_fixture();
  let id = create_session(&fx.state).await;
  let uri = format!("/api/sessions/{id}/settings");

  let (status, body) = post_json(&fx.state, &uri, json!({ "confidence": 0.5 })).await;
  assert_eq!(status, StatusCode::OK);
  assert!((body["confidence"].as_f64().unwrap() - 0.5).abs() < 1e-6);

  let (status, _) = post_json(&fx.state, &uri, json!({ "confidence": 0.0 })).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  let (status, _) = post_json(&fx.state, &uri, json!({ "model": "YOLO11x" })).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let status = status_of(&fx.state, &id).await;
  assert_eq!(status["model"], "YOLO11n (nano)");
  assert!((status["confidence"].as_f64().unwrap() - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn deleted_session_is_gone() {
  let fx = default_fixture();
  let id = create_session(&fx.state).await;

  let request = Request::delete(format!("/api/sessions/{id}"))
    .body(Body::empty())
    .unwrap();
  let (status, _, _) = call(&fx.state, request).await;
  assert_eq!(status, StatusCode::NO_CONTENT);

  let (status, _, body) = get(&fx.state, &format!("/api/sessions/{id}/status")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  let error: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(error["code"], "session_not_found");
}
