// 该文件是 Anfang （安防） 项目的一部分。
// src/server.rs - 网页服务
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

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
  Router,
  extract::DefaultBodyLimit,
  routing::{get, post},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

use crate::{
  config::{ConfigError, ModelCatalog, Settings},
  input::CameraOpener,
  model::{Model, ModelCache, ModelFactory},
  output::draw::Draw,
};

mod api;
mod sessions;

pub use self::api::ApiError;
pub use self::sessions::{Notice, NoticeLevel, Session, SessionRegistry};

struct Shared {
  settings: Settings,
  catalog: ModelCatalog,
  models: ModelCache,
  camera: Arc<dyn CameraOpener>,
  draw: Arc<Draw>,
  sessions: SessionRegistry,
}

/// 所有请求共享的状态。模型缓存是会话之间唯一共享的可变状态
#[derive(Clone)]
pub struct AppState {
  shared: Arc<Shared>,
}

impl AppState {
  pub fn new(
    settings: &Settings,
    factory: impl ModelFactory + 'static,
    camera: Arc<dyn CameraOpener>,
  ) -> Result<Self, ConfigError> {
    let catalog = settings.catalog()?;
    let draw = Draw::new(&settings.annotation);
    info!(
      "模型选项: {:?}, 摄像头: {}, 标签字体: {}",
      catalog.labels().collect::<Vec<_>>(),
      camera.describe(),
      if draw.has_font() { "可用" } else { "不可用" }
    );

    Ok(Self {
      shared: Arc::new(Shared {
        settings: settings.clone(),
        catalog,
        models: ModelCache::new(factory),
        camera,
        draw: Arc::new(draw),
        sessions: SessionRegistry::default(),
      }),
    })
  }

  pub fn settings(&self) -> &Settings {
    &self.shared.settings
  }

  pub fn catalog(&self) -> &ModelCatalog {
    &self.shared.catalog
  }

  pub fn camera(&self) -> &Arc<dyn CameraOpener> {
    &self.shared.camera
  }

  pub fn draw(&self) -> &Arc<Draw> {
    &self.shared.draw
  }

  pub fn sessions(&self) -> &SessionRegistry {
    &self.shared.sessions
  }

  /// 模型名称到权重文件路径
  pub fn model_path(&self, label: &str) -> Result<PathBuf, ConfigError> {
    let path = self.shared.catalog.resolve(label)?;
    Ok(self.shared.settings.model_path(path))
  }

  /// 在阻塞线程上加载模型，同一路径只加载一次
  pub async fn load_model(&self, label: &str) -> Result<Arc<dyn Model>, ApiError> {
    let path = self.model_path(label)?;
    let state = self.clone();
    tokio::task::spawn_blocking(move || state.shared.models.load(&path))
      .await
      .map_err(ApiError::from)?
      .map_err(ApiError::from)
  }
}

pub fn router(state: AppState) -> Router {
  let body_limit = state.settings().max_upload_bytes;

  Router::new()
    .route("/", get(api::index))
    .route("/healthz", get(api::healthz))
    .route("/api/options", get(api::options))
    .route("/api/detect", post(api::detect))
    .route("/api/sessions", post(api::create_session))
    .route(
      "/api/sessions/:id",
      axum::routing::delete(api::delete_session),
    )
    .route("/api/sessions/:id/settings", post(api::update_settings))
    .route("/api/sessions/:id/webcam/start", post(api::start_webcam))
    .route("/api/sessions/:id/webcam/stop", post(api::stop_webcam))
    .route("/api/sessions/:id/frame", get(api::frame))
    .route("/api/sessions/:id/status", get(api::status))
    .layer(DefaultBodyLimit::max(body_limit))
    .with_state(state)
}

/// 定期回收没有请求的会话，它们的采集循环在当前帧结束后退出
pub fn spawn_session_reaper(state: AppState) -> JoinHandle<()> {
  let idle = state.settings().session_idle();
  let period = (idle / 2).max(Duration::from_millis(50));
  info!("会话空闲超时: {:?}", idle);

  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let reaped = state.sessions().reap_idle(idle);
      if !reaped.is_empty() {
        info!("回收 {} 个空闲会话, 剩余 {}", reaped.len(), state.sessions().len());
      }
    }
  })
}

pub async fn serve(
  state: AppState,
  bind: SocketAddr,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
  let listener = tokio::net::TcpListener::bind(bind).await?;
  info!("监听地址: http://{}", listener.local_addr()?);

  let reaper = spawn_session_reaper(state.clone());
  let sessions = state.clone();
  let served = axum::serve(listener, router(state))
    .with_graceful_shutdown(async move {
      shutdown.await;
      info!("停止所有会话...");
      sessions.sessions().stop_all();
    })
    .await;

  reaper.abort();
  served
}
