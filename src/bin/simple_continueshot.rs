// 该文件是 Anfang （安防） 项目的一部分。
// src/bin/simple_continueshot.rs - 摄像头连续推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;
use std::{thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use anfang::{
  FromUrl,
  config::{ConfidenceThreshold, Settings},
  input::camera_from_url,
  model::{ModelCache, Yolo11Factory},
  output::{SaveImageFileOutput, draw::Draw},
  session::SessionState,
  task::{ContinuousTask, Task},
};

/// 从摄像头连续采集并检测，标注结果持续覆盖同一个输出文件，Ctrl-C 停止
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 权重文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,
  /// 摄像头地址，例如 v4l:///dev/video0
  #[arg(long, value_name = "SOURCE", default_value = "v4l:///dev/video0")]
  pub camera: Url,
  /// 输出图片，例如 image:///tmp/latest.jpg
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 置信度阈值 (0.01 - 1.0)
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 处理指定帧数后退出
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// TOML 配置文件，用于检测器与标注参数
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let settings = match &args.config {
    Some(path) => Settings::load(path)?,
    None => Settings::default(),
  };
  let threshold = ConfidenceThreshold::new(args.confidence)?;

  info!("模型文件路径: {}", args.model.display());
  info!("摄像头: {}", args.camera);
  info!("输出路径: {}", args.output);

  let models = ModelCache::new(Yolo11Factory::new(settings.detector.clone()));
  let model = models.load(&args.model)?;
  let camera = camera_from_url(&args.camera)?.open()?;
  let output =
    SaveImageFileOutput::from_url(&args.output)?.with_draw(Draw::new(&settings.annotation));

  let state = Arc::new(SessionState::new());
  state.start();

  let handler_state = Arc::clone(&state);
  ctrlc::set_handler(move || {
    info!("收到中断信号，当前帧结束后退出...");
    handler_state.stop();
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let report = ContinuousTask::new(&state, || threshold)
    .with_frame_number(args.frame_number)
    .run_task(camera, model.as_ref(), &output)?;
  state.release_loop();

  info!("任务完成，共 {} 帧 ({:?})", report.frames, report.reason);
  Ok(())
}
