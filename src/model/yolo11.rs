// 该文件是 Anfang （安防） 项目的一部分。
// src/model/yolo11.rs - YOLO11 检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{Rgb, RgbImage, imageops::FilterType};
use tracing::{debug, error, info};
use tract_onnx::prelude::*;

use crate::{
  config::{ConfidenceThreshold, DetectorSettings},
  frame::{ChannelOrder, Frame},
  model::{DetectItem, DetectResult, InferenceError, Model, ModelError, loader::ModelFactory},
};

/// 边框 4 个数值之后是各类别分数
const YOLO11_BOX_DIMS: usize = 4;
/// 填充区域的灰度值
const LETTERBOX_FILL: u8 = 114;

type Plan = TypedRunnableModel<TypedModel>;

/// 基于 tract 的 YOLO11 ONNX 检测器，输出形状为 [1, 4 + 类别数, 锚点数]
pub struct Yolo11 {
  name: String,
  plan: Plan,
  input_width: u32,
  input_height: u32,
  iou_threshold: f32,
  max_detections: usize,
  labels: Arc<[String]>,
}

pub struct Yolo11Builder {
  model_path: PathBuf,
  input_width: u32,
  input_height: u32,
  iou_threshold: f32,
  max_detections: usize,
  labels: Vec<String>,
}

impl Yolo11Builder {
  pub fn with_settings(model_path: impl Into<PathBuf>, settings: &DetectorSettings) -> Self {
    Self {
      model_path: model_path.into(),
      input_width: settings.input_width,
      input_height: settings.input_height,
      iou_threshold: settings.iou_threshold,
      max_detections: settings.max_detections,
      labels: settings.labels.clone(),
    }
  }

  pub fn build(self) -> Result<Yolo11, ModelError> {
    info!("加载模型文件: {}", self.model_path.display());
    let size = std::fs::metadata(&self.model_path)?.len();
    debug!("模型文件大小: {:.2} MB", size as f64 / (1024.0 * 1024.0));

    let invalid = |stage: &str, e: TractError| {
      error!("{}: {}", stage, e);
      ModelError::Invalid(format!("{}: {}", stage, e))
    };

    let plan = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(|e| invalid("无法解析 ONNX 模型", e))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(
          f32::datum_type(),
          tvec!(1, 3, self.input_height as usize, self.input_width as usize),
        ),
      )
      .map_err(|e| invalid("无法设置模型输入", e))?
      .into_optimized()
      .map_err(|e| invalid("模型优化失败", e))?
      .into_runnable()
      .map_err(|e| invalid("无法创建推理计划", e))?;

    let name = self
      .model_path
      .file_stem()
      .map(|stem| stem.to_string_lossy().into_owned())
      .unwrap_or_else(|| "yolo11".to_string());

    info!(
      "模型加载完成: {} (输入 {}x{})",
      name, self.input_width, self.input_height
    );

    Ok(Yolo11 {
      name,
      plan,
      input_width: self.input_width,
      input_height: self.input_height,
      iou_threshold: self.iou_threshold,
      max_detections: self.max_detections,
      labels: self.labels.into(),
    })
  }
}

/// 供模型缓存使用的工厂
#[derive(Debug, Clone, Default)]
pub struct Yolo11Factory {
  settings: DetectorSettings,
}

impl Yolo11Factory {
  pub fn new(settings: DetectorSettings) -> Self {
    Self { settings }
  }
}

impl ModelFactory for Yolo11Factory {
  fn load(&self, path: &Path) -> Result<Arc<dyn Model>, ModelError> {
    let model = Yolo11Builder::with_settings(path, &self.settings).build()?;
    Ok(Arc::new(model))
  }
}

impl Yolo11 {
  /// 等比缩放后居中填充到网络输入尺寸，归一化到 [0, 1] 的 NCHW 张量
  fn preprocess(&self, input: &Frame) -> Result<(Tensor, Letterbox), InferenceError> {
    let invalid = || InferenceError::InvalidInput(format!("{}x{}", input.width(), input.height()));
    if input.width() == 0 || input.height() == 0 {
      return Err(invalid());
    }
    let image = RgbImage::from_raw(input.width(), input.height(), input.as_nhwc().to_vec())
      .ok_or_else(invalid)?;

    let letterbox = Letterbox::new(
      (input.width(), input.height()),
      (self.input_width, self.input_height),
    );
    let resized = image::imageops::resize(
      &image,
      letterbox.width,
      letterbox.height,
      FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(
      self.input_width,
      self.input_height,
      Rgb([LETTERBOX_FILL; 3]),
    );
    image::imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    let tensor = tract_ndarray::Array4::from_shape_fn(
      (1, 3, self.input_height as usize, self.input_width as usize),
      |(_, c, y, x)| canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0,
    );

    Ok((tensor.into_tensor(), letterbox))
  }

  fn class_name(&self, class_id: u32) -> String {
    self
      .labels
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class {}", class_id))
  }
}

impl Model for Yolo11 {
  fn name(&self) -> &str {
    &self.name
  }

  fn channel_order(&self) -> ChannelOrder {
    ChannelOrder::Rgb
  }

  fn infer(
    &self,
    input: &Frame,
    threshold: ConfidenceThreshold,
  ) -> Result<DetectResult, InferenceError> {
    debug!("设置模型输入");
    let (tensor, letterbox) = self.preprocess(input)?;

    debug!("执行模型推理");
    let outputs = self
      .plan
      .run(tvec!(tensor.into()))
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    let output = outputs
      .first()
      .ok_or_else(|| InferenceError::UnexpectedOutput("模型没有输出".to_string()))?;
    let shape = output.shape().to_vec();
    let data = output
      .as_slice::<f32>()
      .map_err(|e| InferenceError::UnexpectedOutput(e.to_string()))?;

    let (rows, anchors) = match shape.as_slice() {
      [1, rows, anchors] if *rows > YOLO11_BOX_DIMS => (*rows, *anchors),
      other => {
        return Err(InferenceError::UnexpectedOutput(format!(
          "期望形状 [1, 4 + C, N]，实际为 {:?}",
          other
        )));
      }
    };

    let mut items = decode_predictions(
      data,
      rows,
      anchors,
      &letterbox,
      threshold.value(),
    );
    items = non_max_suppression(items, self.iou_threshold, self.max_detections);

    let items = items
      .into_iter()
      .map(|candidate| DetectItem {
        class_id: candidate.class_id,
        class_name: self.class_name(candidate.class_id),
        score: candidate.score,
        bbox: candidate.bbox,
      })
      .collect::<Vec<_>>();

    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::from(items))
  }
}

/// 原始帧到网络输入的等比缩放与填充
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
  scale: f32,
  /// 缩放后的图像尺寸
  width: u32,
  height: u32,
  pad_x: u32,
  pad_y: u32,
  frame_width: f32,
  frame_height: f32,
}

impl Letterbox {
  fn new(frame: (u32, u32), input: (u32, u32)) -> Self {
    let (frame_width, frame_height) = (frame.0 as f32, frame.1 as f32);
    let scale = (input.0 as f32 / frame_width).min(input.1 as f32 / frame_height);
    let width = ((frame_width * scale).round() as u32).clamp(1, input.0);
    let height = ((frame_height * scale).round() as u32).clamp(1, input.1);

    Self {
      scale,
      width,
      height,
      pad_x: (input.0 - width) / 2,
      pad_y: (input.1 - height) / 2,
      frame_width,
      frame_height,
    }
  }

  /// 网络输入坐标转换为原始帧上的归一化坐标
  fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
    let x = (x - self.pad_x as f32) / self.scale / self.frame_width;
    let y = (y - self.pad_y as f32) / self.scale / self.frame_height;
    (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
  }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
  class_id: u32,
  score: f32,
  bbox: [f32; 4],
}

/// 解析按列存放的输出：第 r 行第 i 列位于 `data[r * anchors + i]`
fn decode_predictions(
  data: &[f32],
  rows: usize,
  anchors: usize,
  letterbox: &Letterbox,
  threshold: f32,
) -> Vec<Candidate> {
  let classes = rows - YOLO11_BOX_DIMS;
  let mut candidates = Vec::new();

  if data.len() < rows * anchors {
    error!("输出长度不足: {} < {}", data.len(), rows * anchors);
    return candidates;
  }

  for i in 0..anchors {
    let (class_id, score) = (0..classes)
      .map(|c| (c, data[(YOLO11_BOX_DIMS + c) * anchors + i]))
      .fold((0usize, f32::MIN), |best, current| {
        if current.1 > best.1 { current } else { best }
      });

    if score < threshold {
      continue;
    }

    let cx = data[i];
    let cy = data[anchors + i];
    let w = data[2 * anchors + i];
    let h = data[3 * anchors + i];

    let (x_min, y_min) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
    let (x_max, y_max) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);

    if x_min >= x_max || y_min >= y_max {
      continue;
    }

    candidates.push(Candidate {
      class_id: class_id as u32,
      score,
      bbox: [x_min, y_min, x_max, y_max],
    });
  }

  candidates
}

/// 按类别进行非极大值抑制
fn non_max_suppression(
  mut candidates: Vec<Candidate>,
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    if kept.len() >= max_detections {
      break;
    }
    let suppressed = kept.iter().any(|best| {
      best.class_id == candidate.class_id && iou(&best.bbox, &candidate.bbox) >= iou_threshold
    });
    if !suppressed {
      kept.push(candidate);
    }
  }

  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 构造 [4 + classes, anchors] 的输出，anchor 为 (cx, cy, w, h, scores...)
  fn output(anchors: &[[f32; 6]]) -> Vec<f32> {
    let n = anchors.len();
    let mut data = vec![0.0; 6 * n];
    for (i, anchor) in anchors.iter().enumerate() {
      for (row, value) in anchor.iter().enumerate() {
        data[row * n + i] = *value;
      }
    }
    data
  }

  fn square() -> Letterbox {
    Letterbox::new((640, 640), (640, 640))
  }

  #[test]
  fn decode_keeps_scores_above_threshold() {
    let data = output(&[
      [320.0, 320.0, 64.0, 128.0, 0.9, 0.1],
      [100.0, 100.0, 20.0, 20.0, 0.1, 0.2],
    ]);
    let candidates = decode_predictions(&data, 6, 2, &square(), 0.25);

    assert_eq!(candidates.len(), 1);
    let first = &candidates[0];
    assert_eq!(first.class_id, 0);
    assert!((first.score - 0.9).abs() < 1e-6);
    assert!((first.bbox[0] - 0.45).abs() < 1e-6);
    assert!((first.bbox[1] - 0.4).abs() < 1e-6);
    assert!((first.bbox[2] - 0.55).abs() < 1e-6);
    assert!((first.bbox[3] - 0.6).abs() < 1e-6);
  }

  #[test]
  fn decode_picks_best_class() {
    let data = output(&[[320.0, 320.0, 64.0, 64.0, 0.3, 0.8]]);
    let candidates = decode_predictions(&data, 6, 1, &square(), 0.25);
    assert_eq!(candidates[0].class_id, 1);
  }

  #[test]
  fn decode_tolerates_short_output() {
    assert!(decode_predictions(&[0.0; 5], 6, 2, &square(), 0.1).is_empty());
  }

  #[test]
  fn letterbox_keeps_aspect_ratio() {
    let letterbox = Letterbox::new((320, 240), (640, 640));
    assert!((letterbox.scale - 2.0).abs() < 1e-6);
    assert_eq!((letterbox.width, letterbox.height), (640, 480));
    assert_eq!((letterbox.pad_x, letterbox.pad_y), (0, 80));
  }

  #[test]
  fn decode_removes_letterbox_padding() {
    // 1280x640 的帧缩放为 640x320，上下各填充 160
    let letterbox = Letterbox::new((1280, 640), (640, 640));
    let data = output(&[[320.0, 320.0, 64.0, 64.0, 0.9, 0.0]]);
    let candidates = decode_predictions(&data, 6, 1, &letterbox, 0.25);

    let bbox = candidates[0].bbox;
    let expected = [0.45, 0.4, 0.55, 0.6];
    for (value, expected) in bbox.iter().zip(expected) {
      assert!((value - expected).abs() < 1e-6, "{:?}", bbox);
    }
  }

  #[test]
  fn boxes_in_padding_are_dropped() {
    let letterbox = Letterbox::new((1280, 640), (640, 640));
    let data = output(&[[320.0, 60.0, 64.0, 40.0, 0.9, 0.0]]);
    assert!(decode_predictions(&data, 6, 1, &letterbox, 0.25).is_empty());
  }

  #[test]
  fn nms_suppresses_only_same_class() {
    let a = Candidate {
      class_id: 0,
      score: 0.9,
      bbox: [0.1, 0.1, 0.5, 0.5],
    };
    let b = Candidate {
      class_id: 0,
      score: 0.8,
      bbox: [0.12, 0.12, 0.5, 0.5],
    };
    let c = Candidate {
      class_id: 1,
      score: 0.7,
      bbox: [0.1, 0.1, 0.5, 0.5],
    };

    let kept = non_max_suppression(vec![b.clone(), c.clone(), a.clone()], 0.7, 300);
    assert_eq!(kept, vec![a, c]);
  }

  #[test]
  fn nms_caps_detections() {
    let candidates = (0..10)
      .map(|i| Candidate {
        class_id: i,
        score: 0.5,
        bbox: [0.0, 0.0, 0.1, 0.1],
      })
      .collect();
    assert_eq!(non_max_suppression(candidates, 0.7, 3).len(), 3);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    assert_eq!(iou(&[0.0, 0.0, 0.1, 0.1], &[0.5, 0.5, 0.6, 0.6]), 0.0);
    assert!((iou(&[0.0, 0.0, 0.2, 0.2], &[0.0, 0.0, 0.2, 0.2]) - 1.0).abs() < 1e-6);
  }
}
