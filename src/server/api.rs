// 该文件是 Anfang （安防） 项目的一部分。
// src/server/api.rs - HTTP 接口
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

use std::sync::{Arc, OnceLock};

use axum::{
  Json,
  extract::{Multipart, Path, State, multipart::MultipartError},
  http::{HeaderName, HeaderValue, StatusCode, header},
  response::{Html, IntoResponse, Response},
};
use bytes::Bytes;
use image::{
  ImageError,
  error::{ParameterError, ParameterErrorKind},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{AppState, Notice, Session};
use crate::{
  config::{CONFIDENCE_DEFAULT, CONFIDENCE_MAX, CONFIDENCE_MIN, CONFIDENCE_STEP},
  config::{ConfidenceThreshold, ConfigError},
  frame::Frame,
  input::{BoxedCamera, CameraError, InputError, check_upload_name, decode_upload},
  model::{DetectResult, InferenceError, LoadError, Model},
  output::{
    Render,
    draw::{Draw, encode_png},
  },
  session::{SessionMode, Started},
  task::{ContinuousTask, LoopError, OneShotTask, StopReason, Task, TaskError},
};

const INDEX_HTML: &str = include_str!("index.html");

const DETECTIONS_HEADER: HeaderName = HeaderName::from_static("x-anfang-detections");
const MODEL_HEADER: HeaderName = HeaderName::from_static("x-anfang-model");
const FRAME_HEADER: HeaderName = HeaderName::from_static("x-anfang-frame");

const WEBCAM_STARTED: &str = "Webcam started";
const WEBCAM_STOPPED: &str = "Webcam stopped";

#[derive(Error, Debug)]
pub enum ApiError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Load(#[from] LoadError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error("Cannot open webcam: {0}")]
  Camera(#[from] CameraError),
  #[error(transparent)]
  Input(#[from] InputError),
  #[error("请求无效: {0}")]
  BadRequest(String),
  #[error("会话不存在: {0}")]
  SessionNotFound(Uuid),
  #[error("内部错误: {0}")]
  Internal(String),
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::Config(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Load(LoadError::NotFound(_)) | ApiError::SessionNotFound(_) => {
        StatusCode::NOT_FOUND
      }
      ApiError::Camera(CameraError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Input(InputError::UnsupportedFormat(_)) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
      ApiError::Input(InputError::Decode(_)) => StatusCode::BAD_REQUEST,
      ApiError::Load(_)
      | ApiError::Inference(_)
      | ApiError::Camera(_)
      | ApiError::Input(_)
      | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      ApiError::Config(_) => "configuration_error",
      ApiError::Load(LoadError::NotFound(_)) => "resource_not_found",
      ApiError::Load(_) => "model_load_error",
      ApiError::Inference(_) => "inference_error",
      ApiError::Camera(CameraError::Unavailable { .. }) => "camera_unavailable",
      ApiError::Camera(_) => "camera_error",
      ApiError::Input(InputError::UnsupportedFormat(_)) => "unsupported_format",
      ApiError::Input(_) => "invalid_image",
      ApiError::BadRequest(_) => "bad_request",
      ApiError::SessionNotFound(_) => "session_not_found",
      ApiError::Internal(_) => "internal_error",
    }
  }
}

impl From<tokio::task::JoinError> for ApiError {
  fn from(e: tokio::task::JoinError) -> Self {
    ApiError::Internal(e.to_string())
  }
}

impl From<MultipartError> for ApiError {
  fn from(e: MultipartError) -> Self {
    ApiError::BadRequest(e.body_text())
  }
}

impl From<TaskError> for ApiError {
  fn from(e: TaskError) -> Self {
    match e {
      TaskError::NoInput => ApiError::BadRequest(e.to_string()),
      TaskError::Inference(e) => ApiError::Inference(e),
      TaskError::Render(e) => ApiError::Internal(e.to_string()),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!("请求失败 ({}): {}", status, self);
    } else {
      warn!("请求被拒绝 ({}): {}", status, self);
    }

    let body = Json(json!({
      "error": self.to_string(),
      "code": self.code(),
    }));
    (status, body).into_response()
  }
}

#[derive(Debug, Serialize)]
pub struct ConfidenceRange {
  pub min: f32,
  pub max: f32,
  pub step: f32,
  pub default: f32,
}

#[derive(Debug, Serialize)]
pub struct Options {
  pub models: Vec<String>,
  pub default_model: String,
  pub confidence: ConfidenceRange,
  pub modes: [&'static str; 2],
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
  pub id: Uuid,
  pub mode: SessionMode,
  /// 采集线程是否还在运行，停止后它还会发布最后一帧和结束提示
  pub loop_active: bool,
  pub model: String,
  pub confidence: ConfidenceThreshold,
  pub frames: u64,
  pub detections: Option<usize>,
  pub notice: Option<Notice>,
}

impl SessionStatus {
  fn of(session: &Session) -> Self {
    Self {
      id: session.id(),
      mode: session.state.mode(),
      loop_active: session.is_capturing(),
      model: session.model(),
      confidence: session.confidence(),
      frames: session.display.frames(),
      detections: session.display.latest().map(|image| image.detections),
      notice: session.notice(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
  pub model: Option<String>,
  pub confidence: Option<f32>,
}

fn session_of(state: &AppState, id: Uuid) -> Result<Arc<Session>, ApiError> {
  let session = state.sessions().get(id).ok_or(ApiError::SessionNotFound(id))?;
  session.touch();
  Ok(session)
}

pub(super) async fn index() -> Html<&'static str> {
  Html(INDEX_HTML)
}

pub(super) async fn healthz() -> &'static str {
  "ok"
}

pub(super) async fn options(State(state): State<AppState>) -> Json<Options> {
  let catalog = state.catalog();
  Json(Options {
    models: catalog.labels().map(String::from).collect(),
    default_model: catalog.default_label().to_string(),
    confidence: ConfidenceRange {
      min: CONFIDENCE_MIN,
      max: CONFIDENCE_MAX,
      step: CONFIDENCE_STEP,
      default: CONFIDENCE_DEFAULT,
    },
    modes: ["image", "webcam"],
  })
}

/// 单次检测的渲染目标：标注后编码为 PNG
struct PngOutput<'a> {
  draw: &'a Draw,
  png: OnceLock<Vec<u8>>,
}

impl Render for PngOutput<'_> {
  type Error = ImageError;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    let image = self.draw.annotate(frame, result);
    self.png.set(encode_png(&image)?).map_err(|_| {
      ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::Generic(
        "单次检测只能渲染一帧".to_string(),
      )))
    })
  }
}

fn parse_confidence(text: &str) -> Result<ConfidenceThreshold, ApiError> {
  let value = text
    .trim()
    .parse::<f32>()
    .map_err(|_| ApiError::BadRequest(format!("置信度无效: {}", text)))?;
  Ok(ConfidenceThreshold::new(value)?)
}

/// 图片模式：上传一张图片，返回标注后的 PNG
pub(super) async fn detect(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Response, ApiError> {
  let mut label = None;
  let mut threshold = ConfidenceThreshold::default();
  let mut upload: Option<Bytes> = None;

  while let Some(field) = multipart.next_field().await? {
    let name = field.name().map(str::to_owned);
    match name.as_deref() {
      Some("model") => label = Some(field.text().await?),
      Some("confidence") => threshold = parse_confidence(&field.text().await?)?,
      Some("image") => {
        if let Some(name) = field.file_name() {
          check_upload_name(name)?;
        }
        upload = Some(field.bytes().await?);
      }
      _ => {}
    }
  }

  let image = upload
    .filter(|bytes| !bytes.is_empty())
    .ok_or_else(|| ApiError::BadRequest("请选择图片".to_string()))?;
  let label = label.unwrap_or_else(|| state.catalog().default_label().to_string());
  let model = state.load_model(&label).await?;

  info!(
    "图片检测: 模型 {}, 阈值 {}, {} bytes",
    label,
    threshold,
    image.len()
  );
  let draw = Arc::clone(state.draw());
  let (png, count) = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
    let frame = decode_upload(&image)?;
    let output = PngOutput {
      draw: &draw,
      png: OnceLock::new(),
    };
    let result = OneShotTask::new(threshold).run_task(
      std::iter::once(frame),
      model.as_ref(),
      &output,
    )?;
    let png = output
      .png
      .into_inner()
      .ok_or_else(|| ApiError::Internal("没有生成标注图像".to_string()))?;
    Ok((png, result.len()))
  })
  .await??;

  let mut response = ([(header::CONTENT_TYPE, "image/png")], png).into_response();
  let headers = response.headers_mut();
  headers.insert(DETECTIONS_HEADER, HeaderValue::from(count));
  if let Ok(value) = HeaderValue::from_str(&label) {
    headers.insert(MODEL_HEADER, value);
  }
  Ok(response)
}

pub(super) async fn create_session(
  State(state): State<AppState>,
) -> (StatusCode, Json<SessionStatus>) {
  let session = state.sessions().create(
    state.catalog().default_label().to_string(),
    Arc::clone(state.draw()),
    state.settings().annotation.jpeg_quality,
  );
  (StatusCode::CREATED, Json(SessionStatus::of(&session)))
}

pub(super) async fn update_settings(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
  Json(request): Json<SettingsRequest>,
) -> Result<Json<SessionStatus>, ApiError> {
  let session = session_of(&state, id)?;

  if let Some(label) = &request.model {
    state.catalog().resolve(label)?;
  }
  let confidence = request.confidence.map(ConfidenceThreshold::new).transpose()?;
  session.select(request.model, confidence);

  Ok(Json(SessionStatus::of(&session)))
}

/// 采集线程的收尾：循环因停止以外的原因退出时把会话恢复为停止状态，
/// 最后注销采集线程
struct LoopGuard<'a> {
  session: &'a Session,
  detached: bool,
}

impl LoopGuard<'_> {
  fn release(&mut self) {
    self.session.state.release_loop();
    self.detached = true;
  }
}

impl Drop for LoopGuard<'_> {
  fn drop(&mut self) {
    if !self.detached {
      self.session.state.release_loop();
    }
    self.session.capture_finished();
  }
}

fn run_webcam(session: &Session, model: Arc<dyn Model>, camera: BoxedCamera) {
  let mut guard = LoopGuard {
    session,
    detached: false,
  };

  let task = ContinuousTask::new(&session.state, || session.confidence());
  let outcome = task.run_task(camera, model.as_ref(), &session.display);

  // 以停止结束的循环已在帧末检查时解除挂载
  match &outcome {
    Ok(report) if report.reason == StopReason::Stopped => guard.detached = true,
    _ => guard.release(),
  }

  match outcome {
    Ok(report) => {
      info!(
        "会话 {} 采集结束: {} 帧, {:?}",
        session.id(),
        report.frames,
        report.reason
      );
      session.set_notice(Notice::info(WEBCAM_STOPPED));
    }
    Err(LoopError::Camera(e)) => {
      warn!("会话 {} 摄像头错误: {}", session.id(), e);
      session.set_notice(Notice::error(ApiError::Camera(e).to_string()));
    }
    Err(e) => {
      error!("会话 {} 采集循环失败: {}", session.id(), e);
      session.set_notice(Notice::error(e.to_string()));
    }
  }
}

pub(super) async fn start_webcam(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ApiError> {
  let session = session_of(&state, id)?;

  let model = match state.load_model(&session.model()).await {
    Ok(model) => model,
    Err(e) => {
      session.set_notice(Notice::error(e.to_string()));
      return Err(e);
    }
  };

  match session.state.start() {
    Started::AlreadyRunning | Started::Resumed => return Ok(Json(SessionStatus::of(&session))),
    Started::SpawnLoop => {}
  }

  let opener = Arc::clone(state.camera());
  let opened = tokio::task::spawn_blocking(move || opener.open())
    .await
    .map_err(ApiError::from)
    .and_then(|camera| camera.map_err(ApiError::from));
  let camera = match opened {
    Ok(camera) => camera,
    Err(e) => {
      session.state.release_loop();
      session.set_notice(Notice::error(e.to_string()));
      return Err(e);
    }
  };

  info!("会话 {} 开始采集", session.id());
  session.display.clear();
  session.set_notice(Notice::info(WEBCAM_STARTED));
  session.capture_started();
  let worker = Arc::clone(&session);
  tokio::task::spawn_blocking(move || run_webcam(&worker, model, camera));

  Ok(Json(SessionStatus::of(&session)))
}

pub(super) async fn stop_webcam(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ApiError> {
  let session = session_of(&state, id)?;
  if session.state.stop() {
    info!("会话 {} 请求停止采集", session.id());
  }
  Ok(Json(SessionStatus::of(&session)))
}

pub(super) async fn frame(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
  let session = session_of(&state, id)?;
  let Some(image) = session.display.latest() else {
    return Ok(StatusCode::NO_CONTENT.into_response());
  };

  let mut response = (
    [
      (header::CONTENT_TYPE, "image/jpeg"),
      (header::CACHE_CONTROL, "no-store"),
    ],
    image.jpeg,
  )
    .into_response();
  let headers = response.headers_mut();
  headers.insert(FRAME_HEADER, HeaderValue::from(image.seq));
  headers.insert(DETECTIONS_HEADER, HeaderValue::from(image.detections));
  Ok(response)
}

pub(super) async fn status(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ApiError> {
  let session = session_of(&state, id)?;
  Ok(Json(SessionStatus::of(&session)))
}

pub(super) async fn delete_session(
  State(state): State<AppState>,
  Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
  state
    .sessions()
    .remove(id)
    .ok_or(ApiError::SessionNotFound(id))?;
  Ok(StatusCode::NO_CONTENT)
}
