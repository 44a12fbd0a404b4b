// 该文件是 Radox 项目的一部分。
// src/input.rs - 图像输入与规范化
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

use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::{CanonicalImage, luminance_of};

mod dicom;
mod raster;

pub use self::dicom::{DicomMetadata, extract_dicom_metadata};

#[cfg(feature = "read_image_file")]
mod image_file;
#[cfg(feature = "read_image_file")]
pub use self::image_file::ImageFileInput;

/// 上传文件的最小字节数（由上层协作方校验）
pub const MIN_UPLOAD_BYTES: usize = 1024;
/// 上传文件的最大字节数（由上层协作方校验）
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// 归一化时防止除零的极小量
pub const NORMALIZE_EPSILON: f32 = 1e-8;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("不支持的文件格式: {0}")]
  UnsupportedFormat(String),
  #[error("图像解码错误: {0}")]
  ImageDecodeError(String),
  #[error("文件大小 {size} 字节超出允许范围 [{min}, {max}]")]
  FileSizeError { size: usize, min: usize, max: usize },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl From<image::ImageError> for InputError {
  fn from(err: image::ImageError) -> Self {
    InputError::ImageDecodeError(err.to_string())
  }
}

/// 根据扩展名分派的输入格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
  Jpeg,
  Png,
  Dicom,
}

impl ImageFormat {
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_ascii_lowercase().as_str() {
      "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
      "png" => Some(ImageFormat::Png),
      "dcm" | "dicom" => Some(ImageFormat::Dicom),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ImageFormat::Jpeg => "jpeg",
      ImageFormat::Png => "png",
      ImageFormat::Dicom => "dicom",
    }
  }
}

/// 网络期望的输入通道数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
  Gray,
  Rgb,
}

impl Channels {
  pub fn from_count(count: usize) -> Option<Self> {
    match count {
      1 => Some(Channels::Gray),
      3 => Some(Channels::Rgb),
      _ => None,
    }
  }

  pub fn count(&self) -> usize {
    match self {
      Channels::Gray => 1,
      Channels::Rgb => 3,
    }
  }
}

/// 上传的原始字节及文件名，只被消费一次
#[derive(Debug, Clone)]
pub struct RawImage {
  bytes: Vec<u8>,
  filename: String,
}

impl RawImage {
  pub fn new(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
    Self {
      bytes,
      filename: filename.into(),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn filename(&self) -> &str {
    &self.filename
  }

  pub fn extension(&self) -> Option<&str> {
    self
      .filename
      .rsplit_once('.')
      .map(|(_, ext)| ext)
      .filter(|ext| !ext.is_empty())
  }

  pub fn format(&self) -> Result<ImageFormat, InputError> {
    let ext = self.extension().unwrap_or_default();
    ImageFormat::from_extension(ext).ok_or_else(|| InputError::UnsupportedFormat(ext.to_string()))
  }

  /// 上传大小校验；`ingest` 不调用它，由上层决定是否使用
  pub fn validate_size(&self) -> Result<(), InputError> {
    let size = self.bytes.len();
    if !(MIN_UPLOAD_BYTES..=MAX_UPLOAD_BYTES).contains(&size) {
      return Err(InputError::FileSizeError {
        size,
        min: MIN_UPLOAD_BYTES,
        max: MAX_UPLOAD_BYTES,
      });
    }
    Ok(())
  }
}

/// 将原始字节解码为规范图像（0–255），并适配网络的通道数
pub fn ingest(raw: &RawImage, channels: Channels) -> Result<CanonicalImage, InputError> {
  let format = raw.format()?;
  info!("解码输入图像: {} ({})", raw.filename(), format.as_str());

  let data = match format {
    ImageFormat::Dicom => dicom::decode(raw.bytes())?,
    ImageFormat::Jpeg | ImageFormat::Png => raster::decode(raw.bytes(), format)?,
  };
  debug!("解码后数组形状: {:?}", data.shape());

  let data = conform_channels(data, channels)?;
  Ok(CanonicalImage::new(data, format))
}

/// 灰度与 RGB 之间的通道适配
fn conform_channels(data: ArrayD<f32>, channels: Channels) -> Result<ArrayD<f32>, InputError> {
  match (data.ndim(), channels) {
    (2, Channels::Gray) => Ok(data),
    (2, Channels::Rgb) => {
      let plane = data
        .into_dimensionality::<Ix2>()
        .map_err(|e| InputError::ImageDecodeError(e.to_string()))?;
      let stacked = ndarray::stack(Axis(2), &[plane.view(), plane.view(), plane.view()])
        .map_err(|e| InputError::ImageDecodeError(e.to_string()))?;
      Ok(stacked.into_dyn())
    }
    (3, _) => {
      let cube = data
        .into_dimensionality::<Ix3>()
        .map_err(|e| InputError::ImageDecodeError(e.to_string()))?;
      match (cube.dim().2, channels) {
        (3, Channels::Gray) => Ok(
          luminance_of(
            cube.index_axis(Axis(2), 0),
            cube.index_axis(Axis(2), 1),
            cube.index_axis(Axis(2), 2),
          )
          .into_dyn(),
        ),
        (3, Channels::Rgb) => Ok(cube.into_dyn()),
        (1, Channels::Gray) => Ok(cube.index_axis(Axis(2), 0).to_owned().into_dyn()),
        (1, Channels::Rgb) => {
          let plane = cube.index_axis(Axis(2), 0);
          let stacked = ndarray::stack(Axis(2), &[plane, plane, plane])
            .map_err(|e| InputError::ImageDecodeError(e.to_string()))?;
          Ok(stacked.into_dyn())
        }
        (n, _) => Err(InputError::ImageDecodeError(format!("不支持的通道数: {}", n))),
      }
    }
    (n, _) => Err(InputError::ImageDecodeError(format!("不支持的数组维度: {}", n))),
  }
}

/// 全范围最小-最大归一化到 [0, 255]；动态范围为零时输出全零
pub fn normalize_to_u8_range(values: &[f64]) -> Vec<f32> {
  let (lo, hi) = values
    .iter()
    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
      (lo.min(v), hi.max(v))
    });
  if values.is_empty() || !lo.is_finite() || !hi.is_finite() {
    return vec![0.0; values.len()];
  }
  let range = hi - lo + NORMALIZE_EPSILON as f64;
  values
    .iter()
    .map(|&v| ((v - lo) / range * 255.0).round().clamp(0.0, 255.0) as f32)
    .collect()
}

/// 按窗位/窗宽裁剪并线性映射到 [0, 255]；窗宽非正时退回全范围归一化
pub fn apply_window(values: &[f64], center: f64, width: f64) -> Vec<f32> {
  if !(width > 0.0) || !center.is_finite() || !width.is_finite() {
    return normalize_to_u8_range(values);
  }
  let lo = center - width / 2.0;
  let hi = center + width / 2.0;
  let range = (hi - lo).max(NORMALIZE_EPSILON as f64);
  values
    .iter()
    .map(|&v| ((v.clamp(lo, hi) - lo) / range * 255.0).round() as f32)
    .collect()
}

pub(crate) fn plane_from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Array2<f32>, InputError> {
  Array2::from_shape_vec((rows, cols), data).map_err(|e| InputError::ImageDecodeError(e.to_string()))
}

pub(crate) fn cube_from_vec(
  rows: usize,
  cols: usize,
  channels: usize,
  data: Vec<f32>,
) -> Result<Array3<f32>, InputError> {
  Array3::from_shape_vec((rows, cols, channels), data)
    .map_err(|e| InputError::ImageDecodeError(e.to_string()))
}
