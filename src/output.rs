// 该文件是 Anfang （安防） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use crate::{frame::Frame, model::DetectResult};

/// 检测结果的去处：绘制后交给页面，或者写入文件
pub trait Render {
  type Error: std::error::Error + Send + Sync + 'static;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error>;
}

impl<R: Render + ?Sized> Render for &R {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    (**self).render_result(frame, result)
  }
}

impl<R: Render + ?Sized> Render for Arc<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    (**self).render_result(frame, result)
  }
}

pub mod draw;

mod display_slot;
mod save_image_file;

pub use self::display_slot::{DisplayImage, DisplaySlot};
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};
