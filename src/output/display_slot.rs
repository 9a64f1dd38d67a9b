// 该文件是 Anfang （安防） 项目的一部分。
// src/output/display_slot.rs - 页面显示槽
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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Render, draw::Draw, draw::encode_jpeg};
use crate::{frame::Frame, model::DetectResult};

/// 最近一次绘制的结果
#[derive(Debug, Clone)]
pub struct DisplayImage {
  /// 从 1 开始，每次写入加一
  pub seq: u64,
  pub jpeg: Bytes,
  pub detections: usize,
  pub rendered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slot {
  seq: u64,
  image: Option<DisplayImage>,
}

/// 单个显示区域，新结果覆盖旧结果
pub struct DisplaySlot {
  draw: Arc<Draw>,
  jpeg_quality: u8,
  slot: Mutex<Slot>,
}

impl DisplaySlot {
  pub fn new(draw: Arc<Draw>, jpeg_quality: u8) -> Self {
    Self {
      draw,
      jpeg_quality,
      slot: Mutex::new(Slot::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Slot> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn latest(&self) -> Option<DisplayImage> {
    self.lock().image.clone()
  }

  /// 已写入的帧数
  pub fn frames(&self) -> u64 {
    self.lock().seq
  }

  pub fn clear(&self) {
    self.lock().image = None;
  }
}

impl Render for DisplaySlot {
  type Error = image::ImageError;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    let image = self.draw.annotate(frame, result);
    let jpeg = Bytes::from(encode_jpeg(&image, self.jpeg_quality)?);

    let mut slot = self.lock();
    slot.seq += 1;
    debug!("显示槽更新 #{}, {} bytes", slot.seq, jpeg.len());
    slot.image = Some(DisplayImage {
      seq: slot.seq,
      jpeg,
      detections: result.len(),
      rendered_at: Utc::now(),
    });
    Ok(())
  }
}
