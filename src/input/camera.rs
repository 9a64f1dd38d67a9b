// 该文件是 Anfang （安防） 项目的一部分。
// src/input/camera.rs - 摄像头抽象
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

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use url::Url;

use super::ImageFileInput;
use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

pub const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("摄像头不可用 {device}: {reason}")]
  Unavailable { device: String, reason: String },
  #[error("帧采集失败: {0}")]
  Capture(String),
  #[error("摄像头没有返回任何帧")]
  NoFrame,
  #[error("不支持的摄像头地址: {0}")]
  UnsupportedUrl(String),
}

/// 打开的摄像头。`None` 表示流结束，采集循环拥有它并在退出时释放
pub type BoxedCamera = Box<dyn Iterator<Item = Result<Frame, CameraError>> + Send>;

/// 每次启动摄像头模式时打开一个新的采集流
pub trait CameraOpener: Send + Sync {
  fn open(&self) -> Result<BoxedCamera, CameraError>;

  fn describe(&self) -> String;
}

/// 用一张图片模拟摄像头，`repeat` 为空时无限重复
pub struct StillImageCamera {
  path: PathBuf,
  repeat: Option<usize>,
}

impl StillImageCamera {
  pub fn new(path: impl Into<PathBuf>, repeat: Option<usize>) -> Self {
    Self {
      path: path.into(),
      repeat,
    }
  }
}

impl FromUrl for StillImageCamera {
  type Error = CameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CameraError::UnsupportedUrl(url.to_string()));
    }

    let repeat = url
      .query_pairs()
      .find(|(key, _)| key == "repeat")
      .map(|(_, value)| value.parse::<usize>())
      .transpose()
      .map_err(|_| CameraError::UnsupportedUrl(url.to_string()))?;

    Ok(Self::new(url.path(), repeat))
  }
}

impl FromUrlWithScheme for StillImageCamera {
  const SCHEME: &'static str = "image";
}

impl CameraOpener for StillImageCamera {
  fn open(&self) -> Result<BoxedCamera, CameraError> {
    let frame = ImageFileInput::open(&self.path)
      .map_err(|e| CameraError::Unavailable {
        device: self.describe(),
        reason: e.to_string(),
      })?
      .next()
      .ok_or(CameraError::NoFrame)?;

    let frames = std::iter::repeat(frame).map(Ok);
    Ok(match self.repeat {
      Some(n) => Box::new(frames.take(n)),
      None => Box::new(frames),
    })
  }

  fn describe(&self) -> String {
    format!("image://{}", self.path.display())
  }
}

/// 根据地址选择摄像头实现
pub fn camera_from_url(url: &Url) -> Result<Arc<dyn CameraOpener>, CameraError> {
  info!("摄像头地址: {}", url);
  #[cfg(feature = "v4l2_camera")]
  {
    use super::V4l2Camera;

    if url.scheme() == V4l2Camera::SCHEME {
      return Ok(Arc::new(V4l2Camera::from_url(url)?));
    }
  }
  if url.scheme() == StillImageCamera::SCHEME {
    return Ok(Arc::new(StillImageCamera::from_url(url)?));
  }
  Err(CameraError::UnsupportedUrl(url.to_string()))
}
