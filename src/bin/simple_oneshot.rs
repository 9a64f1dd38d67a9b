// 该文件是 Anfang （安防） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图片推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use anfang::{
  FromUrl,
  config::{ConfidenceThreshold, Settings},
  input::ImageFileInput,
  model::{ModelCache, Yolo11Factory},
  output::{SaveImageFileOutput, draw::Draw},
  task::{OneShotTask, Task},
};

/// 对一张图片做检测并保存标注结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 权重文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,
  /// 输入图片，例如 image:///data/worker.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出图片，例如 image:///tmp/annotated.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 置信度阈值 (0.01 - 1.0)
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  pub confidence: f32,
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
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("置信度阈值: {}", threshold);

  let input = ImageFileInput::from_url(&args.input)?;
  let models = ModelCache::new(Yolo11Factory::new(settings.detector.clone()));
  let model = models.load(&args.model)?;
  let output =
    SaveImageFileOutput::from_url(&args.output)?.with_draw(Draw::new(&settings.annotation));

  let result = OneShotTask::new(threshold).run_task(input, model.as_ref(), &output)?;
  for item in result.iter() {
    info!(
      "  - {}: {:.2}% at [{:.3}, {:.3}, {:.3}, {:.3}]",
      item.class_name,
      item.score * 100.0,
      item.bbox[0],
      item.bbox[1],
      item.bbox[2],
      item.bbox[3]
    );
  }
  info!("检测到 {} 个目标，结果已保存到 {}", result.len(), output.path().display());

  Ok(())
}
