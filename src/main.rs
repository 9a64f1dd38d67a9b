// 该文件是 Anfang （安防） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use anfang::{
  input::camera_from_url,
  model::Yolo11Factory,
  server::{self, AppState},
};

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听中断信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到中断信号，准备退出...");
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();
  let settings = args.settings()?;

  info!("Anfang 安全防护装备检测");
  info!("监听地址: {}", settings.bind);
  info!("摄像头: {}", settings.camera);
  if let Some(dir) = &settings.model_dir {
    info!("模型目录: {}", dir.display());
  }

  let camera_url =
    Url::parse(&settings.camera).with_context(|| format!("摄像头地址无效: {}", settings.camera))?;
  let camera = camera_from_url(&camera_url)?;
  let factory = Yolo11Factory::new(settings.detector.clone());
  let state = AppState::new(&settings, factory, camera)?;

  server::serve(state, settings.bind, shutdown_signal()).await?;

  info!("服务已退出");
  Ok(())
}
