// 该文件是 Radox 项目的一部分。
// src/frame.rs - 规范图像与 NCHW 输入张量定义
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

use image::GrayImage;
use ndarray::{Array2, Array4, ArrayD, Axis};
use thiserror::Error;

use crate::input::ImageFormat;

/// 灰度亮度权重 (R, G, B)
pub const LUMA_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("张量形状无效: {0:?}，期望 [1, C, H, W]")]
  InvalidTensorShape(Vec<usize>),
}

/// 解码后的规范图像，形状为 `[H, W]` 或 `[H, W, C]`，强度范围 0–255。
///
/// 每次变换都产生新的图像，不做原地修改。
#[derive(Debug, Clone)]
pub struct CanonicalImage {
  data: ArrayD<f32>,
  format: ImageFormat,
}

impl CanonicalImage {
  pub fn new(data: ArrayD<f32>, format: ImageFormat) -> Self {
    Self { data, format }
  }

  pub fn from_gray(data: Array2<f32>, format: ImageFormat) -> Self {
    Self {
      data: data.into_dyn(),
      format,
    }
  }

  pub fn data(&self) -> &ArrayD<f32> {
    &self.data
  }

  pub fn format(&self) -> ImageFormat {
    self.format
  }

  pub fn ndim(&self) -> usize {
    self.data.ndim()
  }

  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  pub fn height(&self) -> usize {
    self.data.shape().first().copied().unwrap_or(0)
  }

  pub fn width(&self) -> usize {
    self.data.shape().get(1).copied().unwrap_or(0)
  }

  pub fn channels(&self) -> usize {
    if self.data.ndim() == 3 {
      self.data.shape()[2]
    } else {
      1
    }
  }

  /// 返回 (最小值, 最大值)，空图像返回 (0, 0)
  pub fn min_max(&self) -> (f32, f32) {
    if self.data.is_empty() {
      return (0.0, 0.0);
    }
    self
      .data
      .iter()
      .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
      })
  }

  pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
    Self {
      data: self.data.mapv(f),
      format: self.format,
    }
  }

  /// 单通道亮度平面；三通道图像按感知权重合成
  pub fn luminance(&self) -> Option<Array2<f32>> {
    match self.data.ndim() {
      2 => self
        .data
        .view()
        .into_dimensionality::<ndarray::Ix2>()
        .ok()
        .map(|v| v.to_owned()),
      3 => {
        let view = self.data.view().into_dimensionality::<ndarray::Ix3>().ok()?;
        match view.dim().2 {
          1 => Some(view.index_axis(Axis(2), 0).to_owned()),
          3 => Some(luminance_of(
            view.index_axis(Axis(2), 0),
            view.index_axis(Axis(2), 1),
            view.index_axis(Axis(2), 2),
          )),
          _ => None,
        }
      }
      _ => None,
    }
  }

  /// 转换为 8 位灰度图，用于热力图叠加底图
  pub fn to_luma8(&self) -> Option<GrayImage> {
    let plane = self.luminance()?;
    let (h, w) = plane.dim();
    let pixels = plane
      .iter()
      .map(|&v| v.round().clamp(0.0, 255.0) as u8)
      .collect();
    GrayImage::from_raw(w as u32, h as u32, pixels)
  }
}

pub(crate) fn luminance_of(
  r: ndarray::ArrayView2<f32>,
  g: ndarray::ArrayView2<f32>,
  b: ndarray::ArrayView2<f32>,
) -> Array2<f32> {
  let mut out = Array2::zeros(r.dim());
  ndarray::Zip::from(&mut out)
    .and(&r)
    .and(&g)
    .and(&b)
    .for_each(|o, &r, &g, &b| {
      *o = LUMA_WEIGHTS[0] * r + LUMA_WEIGHTS[1] * g + LUMA_WEIGHTS[2] * b;
    });
  out
}

/// 网络输入张量，形状恒为 `[1, C, H, W]`
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: Array4<f32>,
}

impl TryFrom<Array4<f32>> for InputTensor {
  type Error = FrameError;

  fn try_from(data: Array4<f32>) -> Result<Self, Self::Error> {
    let (n, c, h, w) = data.dim();
    if n != 1 || c == 0 || h == 0 || w == 0 {
      return Err(FrameError::InvalidTensorShape(data.shape().to_vec()));
    }
    Ok(Self { data })
  }
}

impl InputTensor {
  pub fn shape(&self) -> [usize; 4] {
    let (n, c, h, w) = self.data.dim();
    [n, c, h, w]
  }

  pub fn channels(&self) -> usize {
    self.data.dim().1
  }

  pub fn height(&self) -> usize {
    self.data.dim().2
  }

  pub fn width(&self) -> usize {
    self.data.dim().3
  }

  pub fn as_array(&self) -> &Array4<f32> {
    &self.data
  }

  pub fn into_array(self) -> Array4<f32> {
    self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array3, array};

  #[test]
  fn input_tensor_rejects_partial_batch() {
    assert!(InputTensor::try_from(Array4::<f32>::zeros((2, 1, 4, 4))).is_err());
    assert!(InputTensor::try_from(Array4::<f32>::zeros((1, 0, 4, 4))).is_err());
    let tensor = InputTensor::try_from(Array4::<f32>::zeros((1, 3, 8, 6))).unwrap();
    assert_eq!(tensor.shape(), [1, 3, 8, 6]);
    assert_eq!(tensor.channels(), 3);
  }

  #[test]
  fn luminance_uses_perceptual_weights() {
    let mut rgb = Array3::<f32>::zeros((1, 2, 3));
    rgb[[0, 0, 0]] = 255.0;
    rgb[[0, 1, 1]] = 255.0;
    let image = CanonicalImage::new(rgb.into_dyn(), ImageFormat::Png);
    let luma = image.luminance().unwrap();
    assert!((luma[[0, 0]] - 0.2989 * 255.0).abs() < 1e-3);
    assert!((luma[[0, 1]] - 0.5870 * 255.0).abs() < 1e-3);
  }

  #[test]
  fn to_luma8_rounds_and_clamps() {
    let image = CanonicalImage::from_gray(array![[-3.0, 12.4], [254.6, 300.0]], ImageFormat::Png);
    let gray = image.to_luma8().unwrap();
    assert_eq!(gray.as_raw(), &vec![0, 12, 255, 255]);
    assert_eq!(image.min_max(), (-3.0, 300.0));
  }
}
