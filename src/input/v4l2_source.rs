// 该文件是 Anfang （安防） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::pin::Pin;

use image::ImageFormat;
use tracing::{debug, info, warn};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{BoxedCamera, CameraError, CameraOpener, DEFAULT_CAMERA_DEVICE};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame},
};

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Yuyv,
  Rgb3,
  Mjpg,
}

impl PixelFormat {
  fn from_fourcc(fourcc: FourCC) -> Option<Self> {
    match &fourcc.repr {
      b"YUYV" => Some(Self::Yuyv),
      b"RGB3" => Some(Self::Rgb3),
      b"MJPG" => Some(Self::Mjpg),
      _ => None,
    }
  }
}

/// V4L2 摄像头，每次 `open` 打开一个新的采集流
#[derive(Debug, Clone)]
pub struct V4l2Camera {
  device: String,
}

impl V4l2Camera {
  pub fn new(device: impl Into<String>) -> Self {
    Self {
      device: device.into(),
    }
  }
}

impl Default for V4l2Camera {
  fn default() -> Self {
    Self::new(DEFAULT_CAMERA_DEVICE)
  }
}

impl FromUrl for V4l2Camera {
  type Error = CameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CameraError::UnsupportedUrl(url.to_string()));
    }

    match url.path() {
      "" | "/" => Ok(Self::default()),
      path => Ok(Self::new(path)),
    }
  }
}

impl FromUrlWithScheme for V4l2Camera {
  const SCHEME: &'static str = "v4l";
}

impl CameraOpener for V4l2Camera {
  fn open(&self) -> Result<BoxedCamera, CameraError> {
    Ok(Box::new(V4l2Stream::new(&self.device)?))
  }

  fn describe(&self) -> String {
    format!("v4l://{}", self.device)
  }
}

/// 打开的 V4L2 采集流
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备的地址，
/// 从而可以在同一个结构体里保存引用它的 Stream。
pub struct V4l2Stream {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  format: PixelFormat,
  width: u32,
  height: u32,
}

impl V4l2Stream {
  pub fn new(device_path: &str) -> Result<Self, CameraError> {
    let unavailable = |reason: String| CameraError::Unavailable {
      device: device_path.to_string(),
      reason,
    };

    let device = Box::pin(Device::with_path(device_path).map_err(|e| unavailable(e.to_string()))?);

    let mut format = device.format().map_err(|e| unavailable(e.to_string()))?;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| unavailable(e.to_string()))?;

    let pixel = PixelFormat::from_fourcc(format.fourcc)
      .ok_or_else(|| unavailable(format!("不支持的像素格式 {}", format.fourcc)))?;
    info!(
      "摄像头 {} 已打开: {}x{} {}",
      device_path, format.width, format.height, format.fourcc
    );

    let mut source = Self {
      device,
      stream: None,
      format: pixel,
      width: format.width,
      height: format.height,
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 在 Drop 中先于 device 释放
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, BUFFER_COUNT)
        .map_err(|e| unavailable(e.to_string()))?
    };

    source.stream = Some(stream);
    Ok(source)
  }

  fn decode(&self, buffer: &[u8]) -> Result<Frame, CameraError> {
    let capture = |e: String| CameraError::Capture(e);
    match self.format {
      PixelFormat::Yuyv => {
        let rgb = yuyv_to_rgb(buffer, self.width, self.height);
        Frame::from_raw(self.width, self.height, ChannelOrder::Rgb, rgb)
          .map_err(|e| capture(e.to_string()))
      }
      PixelFormat::Rgb3 => {
        let len = (self.width * self.height * 3) as usize;
        let data = buffer.get(..len).ok_or_else(|| capture("帧数据不完整".into()))?;
        Frame::from_raw(self.width, self.height, ChannelOrder::Rgb, data.to_vec())
          .map_err(|e| capture(e.to_string()))
      }
      PixelFormat::Mjpg => {
        let image = image::load_from_memory_with_format(buffer, ImageFormat::Jpeg)
          .map_err(|e| capture(e.to_string()))?;
        Ok(Frame::from(image.to_rgb8()))
      }
    }
  }
}

/// YUYV 4:2:2 转 RGB，每 4 字节两个像素
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let pixels = (width * height) as usize;
  let mut rgb = Vec::with_capacity(pixels * 3);

  for chunk in yuyv.chunks_exact(4).take(pixels / 2) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;

    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Drop for V4l2Stream {
  fn drop(&mut self) {
    // stream 必须在 device 之前释放
    self.stream.take();
    debug!("摄像头已释放");
  }
}

impl Iterator for V4l2Stream {
  type Item = Result<Frame, CameraError>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;

    match stream.next() {
      Ok((buffer, _meta)) => {
        let buffer = buffer.to_vec();
        Some(self.decode(&buffer))
      }
      Err(e) => {
        warn!("无法捕获帧: {}", e);
        Some(Err(CameraError::Capture(e.to_string())))
      }
    }
  }
}
