// 该文件是 Anfang （安防） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::{
  config::AnnotationSettings,
  frame::Frame,
  model::{DetectItem, DetectResult},
};

const PALETTE_SIZE: usize = 20;
const LABEL_PADDING: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const SYSTEM_FONTS: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

fn load_font(path: &Path) -> Option<FontArc> {
  let data = std::fs::read(path).ok()?;
  match FontArc::try_from_vec(data) {
    Ok(font) => Some(font),
    Err(e) => {
      warn!("无法解析字体文件 {}: {}", path.display(), e);
      None
    }
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

/// 在帧上绘制检测框和 `类别 分数` 标签
pub struct Draw {
  font: Option<FontArc>,
  scale: PxScale,
  line_width: u32,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(&AnnotationSettings::default())
  }
}

impl Draw {
  pub fn new(settings: &AnnotationSettings) -> Self {
    let configured = settings.font.as_deref().and_then(|path| {
      let font = load_font(path);
      if font.is_none() {
        warn!("无法加载字体 {}，尝试系统字体", path.display());
      }
      font
    });
    let font = configured.or_else(|| {
      SYSTEM_FONTS
        .iter()
        .map(Path::new)
        .filter(|p| p.exists())
        .find_map(load_font)
    });
    if font.is_none() {
      warn!("没有可用字体，标签将不显示文字");
    }

    // 按类别编号取色，间隔 7 让相邻类别颜色差异更大
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = ((i * 7) % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32 * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font,
      scale: PxScale::from(settings.font_size),
      line_width: settings.line_width.max(1),
      colors,
    }
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_of(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  fn draw_item(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let color = self.color_of(item.class_id);

    let x_min = (item.bbox[0] * w).floor().clamp(0.0, w - 1.0) as i32;
    let y_min = (item.bbox[1] * h).floor().clamp(0.0, h - 1.0) as i32;
    let x_max = (item.bbox[2] * w).ceil().clamp(0.0, w - 1.0) as i32;
    let y_max = (item.bbox[3] * h).ceil().clamp(0.0, h - 1.0) as i32;

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..self.line_width as i32 {
      let width = x_max - x_min - 2 * t + 1;
      let height = y_max - y_min - 2 * t + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", item.class_name, item.score);
    let (text_width, text_height) = match &self.font {
      Some(font) => text_size(self.scale, font, &label),
      None => (0, self.scale.y as u32),
    };

    // 标签放在框的上方，空间不足时放进框内
    let bar_height = text_height as i32 + 2 * LABEL_PADDING;
    let bar_width = if self.font.is_some() {
      text_width as i32 + 2 * LABEL_PADDING
    } else {
      (x_max - x_min + 1).min(bar_height)
    };
    let bar_y = if y_min >= bar_height {
      y_min - bar_height
    } else {
      y_min
    };
    let bar_width = bar_width.min(image.width() as i32 - x_min);
    if bar_width <= 0 {
      return;
    }

    let bar = Rect::at(x_min, bar_y).of_size(bar_width as u32, bar_height as u32);
    draw_filled_rect_mut(image, bar, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        TEXT_COLOR,
        x_min + LABEL_PADDING,
        bar_y + LABEL_PADDING,
        self.scale,
        font,
        &label,
      );
    }
  }

  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.iter() {
      self.draw_item(image, item);
    }
  }

  /// 返回一张新的标注图像，原始帧不变
  pub fn annotate(&self, frame: &Frame, result: &DetectResult) -> RgbImage {
    let mut image = frame.to_rgb_image();
    self.draw_detections(&mut image, result);
    debug!("绘制 {} 个检测框", result.len());
    image
  }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
  let mut bytes = Vec::new();
  image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
  Ok(bytes)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
  let mut bytes = Vec::new();
  let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
  image.write_with_encoder(encoder)?;
  Ok(bytes)
}
