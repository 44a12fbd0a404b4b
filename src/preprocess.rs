// 该文件是 Radox 项目的一部分。
// src/preprocess.rs - 网络输入预处理
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

use ndarray::{Array2, Array3, Array4, ArrayView2, Axis, Ix2, Ix3, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::frame::{CanonicalImage, InputTensor, luminance_of};

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("图像形状无效: {0}")]
  InvalidImageShapeError(String),
}

/// 与训练时一致的强度归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
  /// `((v / 255) - mean) / std`
  MeanStd { mean: f32, std: f32 },
  /// `(v / 255) * 2 * max - max`，映射到 `[-max, max]`
  XrayRange { max_value: f32 },
}

impl Default for Normalization {
  fn default() -> Self {
    Normalization::MeanStd {
      mean: 0.485,
      std: 0.229,
    }
  }
}

impl Normalization {
  pub fn apply(&self, v: f32) -> f32 {
    match *self {
      Normalization::MeanStd { mean, std } => (v / 255.0 - mean) / std,
      Normalization::XrayRange { max_value } => (v / 255.0) * 2.0 * max_value - max_value,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
  pub width: usize,
  pub height: usize,
  pub channels: usize,
  pub normalization: Normalization,
  pub center_crop: bool,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      width: 224,
      height: 224,
      channels: 1,
      normalization: Normalization::default(),
      center_crop: true,
    }
  }
}

/// 裁剪区域，坐标以规范图像像素为单位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
  pub top: usize,
  pub left: usize,
  pub height: usize,
  pub width: usize,
}

impl CropRect {
  pub fn full(height: usize, width: usize) -> Self {
    Self {
      top: 0,
      left: 0,
      height,
      width,
    }
  }

  pub fn contains(&self, y: usize, x: usize) -> bool {
    y >= self.top && y < self.top + self.height && x >= self.left && x < self.left + self.width
  }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
  config: PreprocessConfig,
}

impl Preprocessor {
  pub fn new(config: PreprocessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PreprocessConfig {
    &self.config
  }

  /// 规范图像 → `[1, C, H, W]`：归一化、中心裁剪、双线性缩放、增加维度
  pub fn process(&self, image: &CanonicalImage) -> Result<InputTensor, PreprocessError> {
    self.process_with_region(image).map(|(tensor, _)| tensor)
  }

  /// 同 [`Preprocessor::process`]，并返回网络实际看到的原图区域
  pub fn process_with_region(&self, image: &CanonicalImage) -> Result<(InputTensor, CropRect), PreprocessError> {
    let cfg = &self.config;
    if cfg.width == 0 || cfg.height == 0 || cfg.channels == 0 {
      return Err(PreprocessError::InvalidImageShapeError(format!(
        "目标尺寸无效: {}x{}x{}",
        cfg.channels, cfg.height, cfg.width
      )));
    }
    if image.ndim() < 2 {
      error!("图像维度不足: {:?}", image.shape());
      return Err(PreprocessError::InvalidImageShapeError(format!(
        "至少需要二维图像，实际形状 {:?}",
        image.shape()
      )));
    }
    if image.shape().iter().any(|d| *d == 0) {
      return Err(PreprocessError::InvalidImageShapeError(format!(
        "图像存在零长度维度: {:?}",
        image.shape()
      )));
    }

    let planes = self.channel_planes(image)?;
    let (h, w) = (image.height(), image.width());
    let region = if cfg.center_crop {
      center_crop_rect(h, w, cfg.height, cfg.width)
    } else {
      CropRect::full(h, w)
    };
    let mut tensor = Array4::<f32>::zeros((1, cfg.channels, cfg.height, cfg.width));
    for (c, plane) in planes.iter().enumerate() {
      let normalized = plane.mapv(|v| cfg.normalization.apply(v));
      let cropped = normalized.slice(s![
        region.top..region.top + region.height,
        region.left..region.left + region.width
      ]);
      let resized = resize_bilinear(cropped, cfg.height, cfg.width);
      tensor.slice_mut(s![0, c, .., ..]).assign(&resized);
    }
    debug!(
      "预处理完成: {:?} -> {:?}，裁剪区域 {:?}",
      image.shape(),
      tensor.shape(),
      region
    );

    let tensor = InputTensor::try_from(tensor)
      .map_err(|e| PreprocessError::InvalidImageShapeError(e.to_string()))?;
    Ok((tensor, region))
  }

  /// 将图像拆为与目标通道数一致的平面
  fn channel_planes(&self, image: &CanonicalImage) -> Result<Vec<Array2<f32>>, PreprocessError> {
    let target = self.config.channels;
    let data = image.data().view();
    let invalid = |detail: String| PreprocessError::InvalidImageShapeError(detail);

    match data.ndim() {
      2 => {
        let plane = data
          .into_dimensionality::<Ix2>()
          .map_err(|e| invalid(e.to_string()))?
          .to_owned();
        Ok(vec![plane; target])
      }
      3 => {
        let cube: Array3<f32> = data
          .into_dimensionality::<Ix3>()
          .map_err(|e| invalid(e.to_string()))?
          .to_owned();
        let source = cube.dim().2;
        match (source, target) {
          (s, t) if s == t => Ok(cube.axis_iter(Axis(2)).map(|p| p.to_owned()).collect()),
          (1, t) => Ok(vec![cube.index_axis(Axis(2), 0).to_owned(); t]),
          (3, 1) => Ok(vec![luminance_of(
            cube.index_axis(Axis(2), 0),
            cube.index_axis(Axis(2), 1),
            cube.index_axis(Axis(2), 2),
          )]),
          (s, t) => Err(invalid(format!("无法将 {} 通道映射为 {} 通道", s, t))),
        }
      }
      n => Err(invalid(format!("不支持的图像维度: {}", n))),
    }
  }
}

/// 按目标宽高比取中心区域
fn center_crop_rect(h: usize, w: usize, height: usize, width: usize) -> CropRect {
  let target_ratio = width as f64 / height as f64;
  let ratio = w as f64 / h as f64;
  if (ratio - target_ratio).abs() < f64::EPSILON {
    return CropRect::full(h, w);
  }
  if ratio > target_ratio {
    let new_w = ((h as f64 * target_ratio).round() as usize).clamp(1, w);
    CropRect {
      top: 0,
      left: (w - new_w) / 2,
      height: h,
      width: new_w,
    }
  } else {
    let new_h = ((w as f64 / target_ratio).round() as usize).clamp(1, h);
    CropRect {
      top: (h - new_h) / 2,
      left: 0,
      height: new_h,
      width: w,
    }
  }
}

/// 半像素对齐的双线性插值，不对数值做截断
pub fn resize_bilinear(src: ArrayView2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
  let (in_h, in_w) = src.dim();
  if in_h == out_h && in_w == out_w {
    return src.to_owned();
  }
  if in_h == 0 || in_w == 0 {
    return Array2::zeros((out_h, out_w));
  }

  let scale_y = in_h as f32 / out_h as f32;
  let scale_x = in_w as f32 / out_w as f32;
  let sample = |dst: usize, scale: f32, len: usize| {
    let pos = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    (lo, hi, pos - lo as f32)
  };
  let xs: Vec<_> = (0..out_w).map(|x| sample(x, scale_x, in_w)).collect();

  Array2::from_shape_fn((out_h, out_w), |(y, x)| {
    let (y0, y1, fy) = sample(y, scale_y, in_h);
    let (x0, x1, fx) = xs[x];
    let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
    let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::ImageFormat;
  use ndarray::{Array1, ArrayD, array};

  fn gray(h: usize, w: usize, value: f32) -> CanonicalImage {
    CanonicalImage::from_gray(Array2::from_elem((h, w), value), ImageFormat::Png)
  }

  #[test]
  fn output_shape_is_fixed_for_any_resolution() {
    let pre = Preprocessor::default();
    for (h, w) in [(100, 100), (512, 512), (3000, 4000)] {
      let tensor = pre.process(&gray(h, w, 128.0)).unwrap();
      assert_eq!(tensor.shape(), [1, 1, 224, 224]);
      assert!(tensor.as_array().iter().all(|v| v.is_finite()));
    }
  }

  #[test]
  fn rgb_network_gets_replicated_gray() {
    let pre = Preprocessor::new(PreprocessConfig {
      channels: 3,
      width: 32,
      height: 16,
      ..Default::default()
    });
    let tensor = pre.process(&gray(40, 60, 255.0)).unwrap();
    assert_eq!(tensor.shape(), [1, 3, 16, 32]);
    let expected = (1.0 - 0.485) / 0.229;
    assert!(tensor.as_array().iter().all(|v| (v - expected).abs() < 1e-5));
  }

  #[test]
  fn one_dimensional_input_is_rejected() {
    let image = CanonicalImage::new(Array1::<f32>::zeros(10).into_dyn(), ImageFormat::Png);
    assert!(matches!(
      Preprocessor::default().process(&image),
      Err(PreprocessError::InvalidImageShapeError(_))
    ));
    let empty = CanonicalImage::new(ArrayD::<f32>::zeros(vec![0, 5]), ImageFormat::Png);
    assert!(Preprocessor::default().process(&empty).is_err());
  }

  #[test]
  fn unmappable_channels_are_rejected() {
    let image = CanonicalImage::new(Array3::<f32>::zeros((4, 4, 2)).into_dyn(), ImageFormat::Png);
    assert!(Preprocessor::default().process(&image).is_err());
  }

  #[test]
  fn xray_range_maps_to_symmetric_interval() {
    let norm = Normalization::XrayRange { max_value: 1024.0 };
    assert_eq!(norm.apply(0.0), -1024.0);
    assert_eq!(norm.apply(255.0), 1024.0);
  }

  #[test]
  fn center_crop_keeps_middle() {
    assert_eq!(
      center_crop_rect(2, 4, 1, 1),
      CropRect {
        top: 0,
        left: 1,
        height: 2,
        width: 2
      }
    );
    assert_eq!(center_crop_rect(300, 100, 10, 10).top, 100);
    assert_eq!(center_crop_rect(64, 64, 32, 32), CropRect::full(64, 64));
  }

  #[test]
  fn region_reports_what_the_network_sees() {
    let pre = Preprocessor::new(PreprocessConfig {
      width: 100,
      height: 100,
      normalization: Normalization::XrayRange { max_value: 1.0 },
      ..Default::default()
    });
    let plane = Array2::from_shape_fn((100, 200), |(_, x)| if (60..64).contains(&x) { 255.0 } else { 0.0 });
    let image = CanonicalImage::from_gray(plane, ImageFormat::Png);
    let (tensor, region) = pre.process_with_region(&image).unwrap();
    assert_eq!(
      region,
      CropRect {
        top: 0,
        left: 50,
        height: 100,
        width: 100
      }
    );
    // 亮条纹落在裁剪区域内的第 10..14 列
    let row: Array1<f32> = tensor.as_array().slice(s![0, 0, 50, ..]).to_owned();
    assert_eq!(row[10], 1.0);
    assert_eq!(row[13], 1.0);
    assert_eq!(row[9], -1.0);
    assert_eq!(row[14], -1.0);
    assert!(region.contains(0, 50));
    assert!(!region.contains(0, 49));
  }

  #[test]
  fn bilinear_does_not_clamp_values() {
    let plane = array![[-2.0_f32, 4.0], [-2.0, 4.0]];
    let resized = resize_bilinear(plane.view(), 4, 4);
    assert_eq!(resized[[0, 0]], -2.0);
    assert_eq!(resized[[3, 3]], 4.0);
    assert!((resized[[1, 1]] - -0.5).abs() < 1e-6);
  }
}
