// 该文件是 Radox 项目的一部分。
// src/explain/overlay.rs - 热力图叠加与编码
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

use std::io::Cursor;

use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, imageops::FilterType};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SaliencyError;
use crate::{
  frame::CanonicalImage,
  preprocess::{CropRect, resize_bilinear},
};

pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
  /// 底图权重
  pub base_weight: f32,
  /// 色图权重
  pub heat_weight: f32,
  /// 叠加图最长边上限，None 表示保持原图尺寸
  pub display_max_side: Option<u32>,
}

impl Default for OverlayConfig {
  fn default() -> Self {
    Self {
      base_weight: 0.8,
      heat_weight: 0.2,
      display_max_side: None,
    }
  }
}

/// jet 色图，输入取值 [0, 1]
pub fn jet(v: f32) -> [u8; 3] {
  let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
  let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
  [channel(3.0), channel(2.0), channel(1.0)]
}

/// 将显著性图放回网络所见的区域 `region`，以色图形式与灰度原图加权混合。
///
/// 区域外被裁掉的部分按零显著性着色。
pub fn render_overlay(
  image: &CanonicalImage,
  saliency: &Array2<f32>,
  region: CropRect,
  config: &OverlayConfig,
) -> Result<RgbImage, SaliencyError> {
  let base = image
    .to_luma8()
    .ok_or_else(|| SaliencyError::EncodeError(format!("无法将形状 {:?} 的图像转换为灰度底图", image.shape())))?;
  let (width, height) = base.dimensions();
  if region.height == 0
    || region.width == 0
    || region.top + region.height > height as usize
    || region.left + region.width > width as usize
  {
    return Err(SaliencyError::EncodeError(format!(
      "裁剪区域 {:?} 超出图像范围 {}x{}",
      region, width, height
    )));
  }
  let heat = resize_bilinear(saliency.view(), region.height, region.width);

  let mut overlay = RgbImage::new(width, height);
  for (x, y, pixel) in overlay.enumerate_pixels_mut() {
    let gray = base.get_pixel(x, y).0[0] as f32;
    let (y, x) = (y as usize, x as usize);
    let value = if region.contains(y, x) {
      heat[[y - region.top, x - region.left]]
    } else {
      0.0
    };
    let color = jet(value);
    let mix = |c: u8| (config.base_weight * gray + config.heat_weight * c as f32).round().clamp(0.0, 255.0) as u8;
    *pixel = Rgb([mix(color[0]), mix(color[1]), mix(color[2])]);
  }

  match config.display_max_side {
    Some(limit) if limit > 0 && width.max(height) > limit => {
      let scale = limit as f32 / width.max(height) as f32;
      let (w, h) = (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
      );
      debug!("叠加图缩放: {}x{} -> {}x{}", width, height, w, h);
      Ok(image::imageops::resize(&overlay, w, h, FilterType::Triangle))
    }
    _ => Ok(overlay),
  }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, SaliencyError> {
  let mut buffer = Vec::new();
  DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
  Ok(buffer)
}

pub fn encode_data_uri(image: &RgbImage) -> Result<String, SaliencyError> {
  let png = encode_png(image)?;
  Ok(format!(
    "{}{}",
    DATA_URI_PREFIX,
    base64::engine::general_purpose::STANDARD.encode(png)
  ))
}
