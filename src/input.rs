// 该文件是 Anfang （安防） 项目的一部分。
// src/input.rs - 图像与摄像头输入
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

use image::ImageFormat;
use thiserror::Error;
use tracing::debug;

use crate::frame::Frame;

mod camera;
mod read_image_file;
#[cfg(feature = "v4l2_camera")]
mod v4l2_source;

pub use self::camera::{
  BoxedCamera, CameraError, CameraOpener, DEFAULT_CAMERA_DEVICE, StillImageCamera, camera_from_url,
};
pub use self::read_image_file::ImageFileInput;
#[cfg(feature = "v4l2_camera")]
pub use self::v4l2_source::{V4l2Camera, V4l2Stream};

/// 允许上传的图片扩展名
pub const UPLOAD_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("不支持的图片格式: {0}")]
  UnsupportedFormat(String),
  #[error("图片解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("URI scheme mismatch: expected '{expected}', found '{found}'")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
}

fn is_upload_format(format: ImageFormat) -> bool {
  matches!(
    format,
    ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP
  )
}

/// 按扩展名检查文件名，没有扩展名的交给内容判断
pub fn check_upload_name(name: &str) -> Result<(), InputError> {
  match name.rsplit_once('.') {
    Some((_, ext)) if UPLOAD_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => Ok(()),
    Some((_, ext)) => Err(InputError::UnsupportedFormat(ext.to_string())),
    None => Ok(()),
  }
}

/// 解码上传的图片。格式由内容判断，只接受 jpg/jpeg/png/webp
pub fn decode_upload(bytes: &[u8]) -> Result<Frame, InputError> {
  let format = image::guess_format(bytes)
    .map_err(|_| InputError::UnsupportedFormat("unknown".to_string()))?;
  if !is_upload_format(format) {
    return Err(InputError::UnsupportedFormat(format!("{:?}", format)));
  }

  let image = image::load_from_memory_with_format(bytes, format)?.to_rgb8();
  debug!(
    "上传图片解码完成: {:?} {}x{}",
    format,
    image.width(),
    image.height()
  );
  Ok(Frame::from(image))
}
