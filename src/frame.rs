// 该文件是 Anfang （安防） 项目的一部分。
// src/frame.rs - HWC 帧定义
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

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

const CHANNELS: usize = 3;

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
}

/// 单帧图像，高 × 宽 × 3 通道交错存储
#[derive(Debug, Clone)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  order: ChannelOrder,
}

impl Frame {
  pub fn from_raw(
    width: u32,
    height: u32,
    order: ChannelOrder,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    let expected = CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      order,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    CHANNELS
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  /// 转换到指定的通道顺序，RGB 与 BGR 之间只需交换第 0 与第 2 通道
  pub fn into_order(mut self, order: ChannelOrder) -> Self {
    if self.order != order {
      for pixel in self.data.chunks_exact_mut(CHANNELS) {
        pixel.swap(0, 2);
      }
      self.order = order;
    }
    self
  }

  /// 以 RGB 顺序导出图像，用于绘制和编码
  pub fn to_rgb_image(&self) -> RgbImage {
    let rgb = self.clone().into_order(ChannelOrder::Rgb);
    // 尺寸在构造时已校验
    RgbImage::from_raw(rgb.width, rgb.height, rgb.data.into_vec())
      .unwrap_or_else(|| RgbImage::new(self.width, self.height))
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      order: ChannelOrder::Rgb,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn from_raw_checks_length() {
    let err = Frame::from_raw(2, 2, ChannelOrder::Rgb, vec![0; 11]).unwrap_err();
    assert!(matches!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    ));
    assert!(Frame::from_raw(0, 2, ChannelOrder::Rgb, Vec::new()).is_err());
  }

  #[test]
  fn into_order_swaps_red_and_blue() {
    let frame = Frame::from_raw(2, 1, ChannelOrder::Rgb, vec![1, 2, 3, 4, 5, 6]).unwrap();
    let bgr = frame.into_order(ChannelOrder::Bgr);
    assert_eq!(bgr.order(), ChannelOrder::Bgr);
    assert_eq!(bgr.as_nhwc(), &[3, 2, 1, 6, 5, 4]);

    let same = bgr.clone().into_order(ChannelOrder::Bgr);
    assert_eq!(same.as_nhwc(), bgr.as_nhwc());
  }

  #[test]
  fn bgr_frame_exports_rgb_image() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(1, 1, Rgb([200, 10, 30]));
    let frame = Frame::from(image.clone()).into_order(ChannelOrder::Bgr);
    assert_eq!(frame.to_rgb_image(), image);
  }
}
