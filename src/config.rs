// 该文件是 Anfang （安防） 项目的一部分。
// src/config.rs - 配置与模型选项
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

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// 置信度滑块下限
pub const CONFIDENCE_MIN: f32 = 0.01;
/// 置信度滑块上限
pub const CONFIDENCE_MAX: f32 = 1.0;
/// 置信度滑块步长
pub const CONFIDENCE_STEP: f32 = 0.01;
/// 默认置信度
pub const CONFIDENCE_DEFAULT: f32 = 0.25;

const CONFIDENCE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知的模型选项: {0}")]
  UnknownModel(String),
  #[error("模型选项重复: {0}")]
  DuplicateModel(String),
  #[error("模型列表为空")]
  EmptyCatalog,
  #[error("置信度阈值 {0} 超出范围 [{min}, {max}]", min = CONFIDENCE_MIN, max = CONFIDENCE_MAX)]
  InvalidConfidence(f32),
  #[error("无法读取配置文件 {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] toml::de::Error),
}

/// 置信度阈值，取值范围 [0.01, 1.0]，按 0.01 的步长取整
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct ConfidenceThreshold(f32);

impl ConfidenceThreshold {
  pub fn new(value: f32) -> Result<Self, ConfigError> {
    if !value.is_finite()
      || value < CONFIDENCE_MIN - CONFIDENCE_EPSILON
      || value > CONFIDENCE_MAX + CONFIDENCE_EPSILON
    {
      return Err(ConfigError::InvalidConfidence(value));
    }

    let steps = (value / CONFIDENCE_STEP).round();
    Ok(Self((steps * CONFIDENCE_STEP).clamp(CONFIDENCE_MIN, CONFIDENCE_MAX)))
  }

  pub fn value(self) -> f32 {
    self.0
  }
}

impl Default for ConfidenceThreshold {
  fn default() -> Self {
    Self(CONFIDENCE_DEFAULT)
  }
}

impl TryFrom<f32> for ConfidenceThreshold {
  type Error = ConfigError;

  fn try_from(value: f32) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<ConfidenceThreshold> for f32 {
  fn from(threshold: ConfidenceThreshold) -> Self {
    threshold.0
  }
}

impl std::fmt::Display for ConfidenceThreshold {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{:.2}", self.0)
  }
}

/// 模型选项：界面显示的名称与权重文件路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
  pub label: String,
  pub path: PathBuf,
}

impl ModelEntry {
  pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    Self {
      label: label.into(),
      path: path.into(),
    }
  }
}

fn default_model_entries() -> Vec<ModelEntry> {
  vec![
    ModelEntry::new("YOLO11n (nano)", "best_yolo11n.pt"),
    ModelEntry::new("YOLO11s (small)", "best_yolo11s.pt"),
  ]
}

/// 模型选项表，顺序即下拉框顺序，第一项为默认选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
  entries: Vec<ModelEntry>,
}

impl Default for ModelCatalog {
  fn default() -> Self {
    Self {
      entries: default_model_entries(),
    }
  }
}

impl ModelCatalog {
  pub fn new(entries: Vec<ModelEntry>) -> Result<Self, ConfigError> {
    if entries.is_empty() {
      return Err(ConfigError::EmptyCatalog);
    }

    let mut seen = HashSet::new();
    for entry in &entries {
      if !seen.insert(entry.label.as_str()) {
        return Err(ConfigError::DuplicateModel(entry.label.clone()));
      }
    }

    Ok(Self { entries })
  }

  /// 将模型名称解析为权重文件路径
  pub fn resolve(&self, label: &str) -> Result<&Path, ConfigError> {
    self
      .entries
      .iter()
      .find(|entry| entry.label == label)
      .map(|entry| entry.path.as_path())
      .ok_or_else(|| ConfigError::UnknownModel(label.to_string()))
  }

  pub fn labels(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|entry| entry.label.as_str())
  }

  pub fn default_label(&self) -> &str {
    // new() 保证非空
    &self.entries[0].label
  }

  pub fn entries(&self) -> &[ModelEntry] {
    &self.entries
  }
}

/// 检测器参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorSettings {
  pub input_width: u32,
  pub input_height: u32,
  pub iou_threshold: f32,
  pub max_detections: usize,
  /// 类别名称，按类别编号排列；为空时使用 "class N"
  pub labels: Vec<String>,
}

impl Default for DetectorSettings {
  fn default() -> Self {
    Self {
      input_width: 640,
      input_height: 640,
      iou_threshold: 0.7,
      max_detections: 300,
      labels: Vec::new(),
    }
  }
}

/// 标注绘制参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnotationSettings {
  /// TrueType 字体文件，缺省时尝试系统字体
  pub font: Option<PathBuf>,
  pub font_size: f32,
  pub line_width: u32,
  pub jpeg_quality: u8,
}

impl Default for AnnotationSettings {
  fn default() -> Self {
    Self {
      font: None,
      font_size: 18.0,
      line_width: 2,
      jpeg_quality: 80,
    }
  }
}

/// 全局配置，对应 TOML 配置文件，所有字段均有默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
  pub bind: SocketAddr,
  /// 模型路径的基准目录，相对路径在此目录下解析
  pub model_dir: Option<PathBuf>,
  pub models: Vec<ModelEntry>,
  pub camera: String,
  pub max_upload_bytes: usize,
  /// 会话在这段时间内没有任何请求即被回收，单位毫秒
  pub session_idle_ms: u64,
  pub detector: DetectorSettings,
  pub annotation: AnnotationSettings,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 8501)),
      model_dir: None,
      models: default_model_entries(),
      camera: "v4l:///dev/video0".to_string(),
      max_upload_bytes: 20 * 1024 * 1024,
      session_idle_ms: 30_000,
      detector: DetectorSettings::default(),
      annotation: AnnotationSettings::default(),
    }
  }
}

impl Settings {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&text)
  }

  pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
    let settings: Settings = toml::from_str(text)?;
    debug!("配置内容: {:?}", settings);
    Ok(settings)
  }

  pub fn catalog(&self) -> Result<ModelCatalog, ConfigError> {
    ModelCatalog::new(self.models.clone())
  }

  pub fn session_idle(&self) -> Duration {
    Duration::from_millis(self.session_idle_ms)
  }

  /// 将选项表中的路径定位到磁盘路径
  pub fn model_path(&self, path: &Path) -> PathBuf {
    match &self.model_dir {
      Some(dir) if path.is_relative() => dir.join(path),
      _ => path.to_path_buf(),
    }
  }
}
