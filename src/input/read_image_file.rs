// 该文件是 Anfang （安防） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use tracing::error;
use url::Url;

use super::{InputError, check_upload_name, decode_upload};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

/// 单张图片输入，迭代一次后结束
pub struct ImageFileInput {
  frame: Option<Frame>,
}

impl ImageFileInput {
  pub fn open(path: &Path) -> Result<Self, InputError> {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
      check_upload_name(name)?;
    }
    let bytes = std::fs::read(path)?;
    Ok(Self {
      frame: Some(decode_upload(&bytes)?),
    })
  }
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    Self::open(Path::new(url.path()))
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl Iterator for ImageFileInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    self.frame.take()
  }
}
