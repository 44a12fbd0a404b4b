// 该文件是 Radox 项目的一部分。
// src/explain/gradcam.rs - Grad-CAM
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

use ndarray::{Array2, Axis};
use tracing::debug;

use super::{Differentiable, SaliencyError, is_degenerate};
use crate::{frame::InputTensor, model::NetworkError};

/// 目标层分辨率下的类激活图，退化时返回 None
pub(super) fn grad_cam(
  model: &impl Differentiable,
  input: &InputTensor,
  target: usize,
  layer_override: Option<&str>,
  epsilon: f32,
) -> Result<Option<Array2<f32>>, SaliencyError> {
  let layer = match layer_override {
    Some(name) => name.to_string(),
    None => model.gradcam_layer().ok_or(SaliencyError::SaliencyUnavailableError)?,
  };
  let capture = model.capture_layer(input, &layer, target)?;
  let (channels, h, w) = capture.activations.dim();
  if capture.gradients.dim() != (channels, h, w) {
    return Err(NetworkError::ShapeMismatch(format!("层 {} 的激活与梯度形状不一致", layer)).into());
  }
  debug!("Grad-CAM 目标层 {} ({}x{}x{})，目标分数 {:.4}", layer, channels, h, w, capture.score);

  let mut cam = Array2::<f32>::zeros((h, w));
  for (activation, gradient) in capture
    .activations
    .axis_iter(Axis(0))
    .zip(capture.gradients.axis_iter(Axis(0)))
  {
    let weight = gradient.mean().unwrap_or(0.0);
    if weight != 0.0 {
      cam.scaled_add(weight, &activation);
    }
  }
  cam.mapv_inplace(|v| v.max(0.0));

  if is_degenerate(&cam, epsilon) {
    return Ok(None);
  }
  Ok(Some(cam))
}
