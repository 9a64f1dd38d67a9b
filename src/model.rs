// 该文件是 Anfang （安防） 项目的一部分。
// src/model.rs - 模型
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

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  config::ConfidenceThreshold,
  frame::{ChannelOrder, Frame},
};

/// 检测器。实现需要能在多个会话之间共享
pub trait Model: Send + Sync {
  fn name(&self) -> &str;

  /// 检测器期望的输入通道顺序
  fn channel_order(&self) -> ChannelOrder;

  fn infer(
    &self,
    input: &Frame,
    threshold: ConfidenceThreshold,
  ) -> Result<DetectResult, InferenceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub class_name: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，相对帧尺寸归一化
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DetectItem> {
    self.items.iter()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 模型加载阶段的错误
#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  Invalid(String),
}

/// 推理阶段的错误，不重试，直接交给上层
#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入帧尺寸无效: {0}")]
  InvalidInput(String),
  #[error("推理失败: {0}")]
  Backend(String),
  #[error("模型输出格式不符: {0}")]
  UnexpectedOutput(String),
}

/// 推理调用：按检测器的通道顺序准备输入，然后交给检测器
pub fn infer_frame(
  model: &dyn Model,
  frame: &Frame,
  threshold: ConfidenceThreshold,
) -> Result<DetectResult, InferenceError> {
  let expected = model.channel_order();
  if frame.order() == expected {
    return model.infer(frame, threshold);
  }

  debug!("通道顺序转换 {:?} -> {:?}", frame.order(), expected);
  let converted = frame.clone().into_order(expected);
  model.infer(&converted, threshold)
}

pub mod loader;
mod yolo11;

pub use self::loader::{LoadError, ModelCache, ModelFactory};
pub use self::yolo11::{Yolo11, Yolo11Builder, Yolo11Factory};
