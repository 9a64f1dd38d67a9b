// 该文件是 Anfang （安防） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::net::SocketAddr;
use std::path::PathBuf;

use anfang::config::{ConfigError, Settings};
use clap::Parser;

/// Anfang 安全防护装备检测服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// TOML 配置文件，未给出的字段使用默认值
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 监听地址，默认 0.0.0.0:8501
  #[arg(long, value_name = "ADDR")]
  pub bind: Option<SocketAddr>,

  /// 摄像头地址
  /// 支持格式:
  /// - V4L2: v4l:///dev/video0
  /// - 图片: image:///path/to/frame.jpg?repeat=100
  #[arg(long, value_name = "URL")]
  pub camera: Option<String>,

  /// 权重文件所在目录
  #[arg(long, value_name = "DIR")]
  pub model_dir: Option<PathBuf>,
}

impl Args {
  /// 配置文件之上叠加命令行参数
  pub fn settings(&self) -> Result<Settings, ConfigError> {
    let mut settings = match &self.config {
      Some(path) => Settings::load(path)?,
      None => Settings::default(),
    };

    if let Some(bind) = self.bind {
      settings.bind = bind;
    }
    if let Some(camera) = &self.camera {
      settings.camera = camera.clone();
    }
    if let Some(dir) = &self.model_dir {
      settings.model_dir = Some(dir.clone());
    }
    Ok(settings)
  }
}
