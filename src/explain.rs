// 该文件是 Radox 项目的一部分。
// src/explain.rs - 可解释性引擎
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

//! 显著性图计算。
//!
//! 按 [`ExplainConfig::strategies`] 的顺序依次尝试，每个策略的结果都要通过
//! [`is_degenerate`] 检查；全部退化时返回
//! [`SaliencyError::SaliencyUnavailableError`]，由调用方决定是否省略热力图。

use std::fmt;

use image::RgbImage;
use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{CanonicalImage, InputTensor},
  model::{ModelError, NetworkError},
  preprocess::CropRect,
};

mod gradcam;
mod input_gradient;
pub mod overlay;

pub use self::overlay::{DATA_URI_PREFIX, OverlayConfig};

/// 判定显著性图退化的默认阈值
pub const DEFAULT_DEGENERACY_EPSILON: f32 = 1e-8;
/// 输入梯度平滑的默认高斯核标准差
pub const DEFAULT_BLUR_SIGMA: f32 = 5.0;

#[derive(Error, Debug)]
pub enum SaliencyError {
  #[error("所有显著性策略均退化，无法生成热力图")]
  SaliencyUnavailableError,
  #[error("网络错误: {0}")]
  NetworkError(#[from] NetworkError),
  #[error("模型错误: {0}")]
  ModelError(#[from] ModelError),
  #[error("热力图编码错误: {0}")]
  EncodeError(String),
}

impl From<image::ImageError> for SaliencyError {
  fn from(err: image::ImageError) -> Self {
    SaliencyError::EncodeError(err.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaliencyMethod {
  GradCam,
  InputGradient,
}

impl fmt::Display for SaliencyMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SaliencyMethod::GradCam => f.write_str("Grad-CAM"),
      SaliencyMethod::InputGradient => f.write_str("输入梯度"),
    }
  }
}

/// 单次前向+反向得到的目标层激活与梯度，形状均为 `[C, H, W]`
#[derive(Debug, Clone)]
pub struct LayerCapture {
  pub activations: Array3<f32>,
  pub gradients: Array3<f32>,
  pub score: f32,
}

/// 能对目标输出求梯度的模型
pub trait Differentiable {
  /// 默认的 Grad-CAM 目标层名
  fn gradcam_layer(&self) -> Option<String>;

  fn capture_layer(&self, input: &InputTensor, layer: &str, target: usize) -> Result<LayerCapture, SaliencyError>;

  /// 目标输出对输入的梯度，形状 `[1, C, H, W]`
  fn input_gradient(&self, input: &InputTensor, target: usize) -> Result<Array4<f32>, SaliencyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
  pub epsilon: f32,
  pub strategies: Vec<SaliencyMethod>,
  /// 覆盖自动选择的 Grad-CAM 目标层
  pub target_layer: Option<String>,
  pub blur_sigma: f32,
  pub overlay: OverlayConfig,
}

impl Default for ExplainConfig {
  fn default() -> Self {
    Self {
      epsilon: DEFAULT_DEGENERACY_EPSILON,
      strategies: vec![SaliencyMethod::GradCam, SaliencyMethod::InputGradient],
      target_layer: None,
      blur_sigma: DEFAULT_BLUR_SIGMA,
      overlay: OverlayConfig::default(),
    }
  }
}

/// 取值 [0, 1]、尺寸与网络输入一致的显著性图
#[derive(Debug, Clone)]
pub struct SaliencyMap {
  map: Array2<f32>,
  method: SaliencyMethod,
}

impl SaliencyMap {
  pub fn map(&self) -> &Array2<f32> {
    &self.map
  }

  pub fn method(&self) -> SaliencyMethod {
    self.method
  }

  pub fn height(&self) -> usize {
    self.map.nrows()
  }

  pub fn width(&self) -> usize {
    self.map.ncols()
  }

  pub fn into_array(self) -> Array2<f32> {
    self.map
  }
}

/// 动态范围小于 `epsilon` 或含非有限值即视为退化
pub fn is_degenerate(map: &Array2<f32>, epsilon: f32) -> bool {
  if map.is_empty() || map.iter().any(|v| !v.is_finite()) {
    return true;
  }
  let (lo, hi) = map
    .iter()
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  hi - lo < epsilon
}

/// 最小-最大归一化到 [0, 1]；退化时返回 None
pub fn normalize_saliency(map: &Array2<f32>, epsilon: f32) -> Option<Array2<f32>> {
  if is_degenerate(map, epsilon) {
    return None;
  }
  let (lo, hi) = map
    .iter()
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  let range = hi - lo;
  Some(map.mapv(|v| ((v - lo) / range).clamp(0.0, 1.0)))
}

#[derive(Debug, Clone, Default)]
pub struct Explainer {
  config: ExplainConfig,
}

impl Explainer {
  pub fn new(config: ExplainConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &ExplainConfig {
    &self.config
  }

  /// 依次尝试各策略，返回第一个非退化的显著性图
  pub fn explain(
    &self,
    model: &impl Differentiable,
    input: &InputTensor,
    target: usize,
  ) -> Result<SaliencyMap, SaliencyError> {
    let (height, width) = (input.height(), input.width());
    for &method in &self.config.strategies {
      debug!("尝试显著性策略: {}", method);
      let attempt = match method {
        SaliencyMethod::GradCam => {
          gradcam::grad_cam(model, input, target, self.config.target_layer.as_deref(), self.config.epsilon)
        }
        SaliencyMethod::InputGradient => {
          input_gradient::smoothed_input_gradient(model, input, target, self.config.blur_sigma, self.config.epsilon)
        }
      };

      match attempt {
        Ok(Some(raw)) => {
          let resized = crate::preprocess::resize_bilinear(raw.view(), height, width);
          if let Some(map) = normalize_saliency(&resized, self.config.epsilon) {
            info!("显著性图由 {} 生成", method);
            return Ok(SaliencyMap { map, method });
          }
          warn!("{} 缩放后退化，尝试下一策略", method);
        }
        Ok(None) => warn!("{} 结果退化，尝试下一策略", method),
        Err(SaliencyError::ModelError(e)) => return Err(SaliencyError::ModelError(e)),
        Err(e) => warn!("{} 计算失败: {}，尝试下一策略", method, e),
      }
    }
    Err(SaliencyError::SaliencyUnavailableError)
  }

  /// 将显著性图叠加到原图上，`region` 为预处理时网络实际看到的区域
  pub fn overlay(
    &self,
    image: &CanonicalImage,
    saliency: &SaliencyMap,
    region: CropRect,
  ) -> Result<RgbImage, SaliencyError> {
    overlay::render_overlay(image, saliency.map(), region, &self.config.overlay)
  }

  /// 叠加并编码为 `data:image/png;base64,` 数据 URI
  pub fn heatmap_data_uri(
    &self,
    image: &CanonicalImage,
    saliency: &SaliencyMap,
    region: CropRect,
  ) -> Result<String, SaliencyError> {
    let overlay = self.overlay(image, saliency, region)?;
    overlay::encode_data_uri(&overlay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Conv2d, Layer, Linear, Network, Node};
  use ndarray::{Array1, array};

  /// 激活梯度全为零、但输入梯度非零的桩模型
  struct FlatLayerModel;

  impl Differentiable for FlatLayerModel {
    fn gradcam_layer(&self) -> Option<String> {
      Some("features".to_string())
    }

    fn capture_layer(&self, _: &InputTensor, _: &str, _: usize) -> Result<LayerCapture, SaliencyError> {
      Ok(LayerCapture {
        activations: Array3::ones((4, 7, 7)),
        gradients: Array3::zeros((4, 7, 7)),
        score: 0.0,
      })
    }

    fn input_gradient(&self, input: &InputTensor, _: usize) -> Result<Array4<f32>, SaliencyError> {
      let [_, c, h, w] = input.shape();
      Ok(Array4::from_shape_fn((1, c, h, w), |(_, _, y, x)| if x < w / 2 && y < h / 2 { 1.0 } else { 0.0 }))
    }
  }

  fn input(h: usize, w: usize) -> InputTensor {
    InputTensor::try_from(Array4::from_shape_fn((1, 1, h, w), |(_, _, _, x)| if x < w / 2 { 2.0 } else { 0.0 })).unwrap()
  }

  /// conv(1x1, w=1) → relu → 全局池化 → linear(w)
  fn linear_probe(weight: f32) -> Network {
    let conv = Conv2d::new(array![[[[1.0]]]], Some(array![0.0]), 1, 0).unwrap();
    let linear = Linear::new(array![[weight]], Array1::zeros(1)).unwrap();
    Network::new(
      vec![Node::new("features", Layer::Conv2d(conv))],
      vec![
        Node::new("relu", Layer::Relu),
        Node::new("pool", Layer::GlobalAvgPool),
        Node::new("classifier", Layer::Linear(linear)),
      ],
      [1, 16, 16],
    )
    .unwrap()
  }

  #[test]
  fn zero_range_normalization_is_degenerate() {
    let flat = Array2::from_elem((8, 8), 0.25_f32);
    assert!(is_degenerate(&flat, DEFAULT_DEGENERACY_EPSILON));
    assert!(normalize_saliency(&flat, DEFAULT_DEGENERACY_EPSILON).is_none());
    let mut nan = Array2::from_elem((2, 2), 1.0_f32);
    nan[[0, 0]] = f32::NAN;
    assert!(is_degenerate(&nan, DEFAULT_DEGENERACY_EPSILON));
  }

  #[test]
  fn degenerate_gradcam_falls_back_to_input_gradient() {
    let explainer = Explainer::default();
    let saliency = explainer.explain(&FlatLayerModel, &input(32, 32), 0).unwrap();
    assert_eq!(saliency.method(), SaliencyMethod::InputGradient);
    assert_eq!((saliency.height(), saliency.width()), (32, 32));
    let (lo, hi) = saliency
      .map()
      .iter()
      .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    assert_eq!(lo, 0.0);
    assert_eq!(hi, 1.0);
  }

  #[test]
  fn gradcam_localizes_positive_evidence() {
    let explainer = Explainer::default();
    let saliency = explainer.explain(&linear_probe(1.0), &input(16, 16), 0).unwrap();
    assert_eq!(saliency.method(), SaliencyMethod::GradCam);
    assert!(saliency.map()[[8, 2]] > saliency.map()[[8, 13]]);
  }

  #[test]
  fn negative_evidence_degenerates_cam_and_uses_fallback() {
    let explainer = Explainer::default();
    let saliency = explainer.explain(&linear_probe(-1.0), &input(16, 16), 0).unwrap();
    assert_eq!(saliency.method(), SaliencyMethod::InputGradient);
  }

  #[test]
  fn no_gradient_at_all_is_unavailable() {
    let explainer = Explainer::default();
    assert!(matches!(
      explainer.explain(&linear_probe(0.0), &input(16, 16), 0),
      Err(SaliencyError::SaliencyUnavailableError)
    ));
  }

  #[test]
  fn unknown_override_layer_still_falls_back() {
    let explainer = Explainer::new(ExplainConfig {
      target_layer: Some("denseblock9".to_string()),
      ..Default::default()
    });
    let saliency = explainer.explain(&linear_probe(1.0), &input(16, 16), 0).unwrap();
    assert_eq!(saliency.method(), SaliencyMethod::InputGradient);
  }
}
