// 该文件是 Radox 项目的一部分。
// src/explain/input_gradient.rs - 平滑输入梯度
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

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array2, Axis};

use super::{Differentiable, SaliencyError, is_degenerate};
use crate::frame::InputTensor;

pub(super) fn smoothed_input_gradient(
  model: &impl Differentiable,
  input: &InputTensor,
  target: usize,
  sigma: f32,
  epsilon: f32,
) -> Result<Option<Array2<f32>>, SaliencyError> {
  let grad = model.input_gradient(input, target)?;
  let plane = grad.index_axis(Axis(0), 0);
  let magnitude = plane
    .map(|v| v.abs())
    .fold_axis(Axis(0), 0.0_f32, |acc, &v| acc.max(v));

  let peak = magnitude.iter().copied().fold(0.0_f32, f32::max);
  if !peak.is_finite() || peak <= 0.0 {
    return Ok(None);
  }
  let scaled = magnitude.mapv(|v| v / peak);
  let smoothed = if sigma > 0.0 { blur(&scaled, sigma) } else { scaled };

  if is_degenerate(&smoothed, epsilon) {
    return Ok(None);
  }
  Ok(Some(smoothed))
}

/// 在 16 位灰度上做高斯平滑，输入取值 [0, 1]
fn blur(plane: &Array2<f32>, sigma: f32) -> Array2<f32> {
  let (h, w) = plane.dim();
  let quantized = plane
    .iter()
    .map(|&v| (v.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16)
    .collect();
  let buffer: ImageBuffer<Luma<u16>, Vec<u16>> = match ImageBuffer::from_raw(w as u32, h as u32, quantized) {
    Some(buffer) => buffer,
    None => return plane.clone(),
  };
  let blurred = gaussian_blur_f32(&buffer, sigma);
  let values = blurred
    .into_raw()
    .into_iter()
    .map(|v| v as f32 / u16::MAX as f32)
    .collect();
  Array2::from_shape_vec((h, w), values).unwrap_or_else(|_| plane.clone())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blur_keeps_shape_and_spreads_peak() {
    let mut plane = Array2::<f32>::zeros((21, 21));
    plane[[10, 10]] = 1.0;
    let blurred = blur(&plane, 2.0);
    assert_eq!(blurred.dim(), (21, 21));
    assert!(blurred[[10, 10]] < 1.0);
    assert!(blurred[[10, 12]] > 0.0);
    assert!(blurred[[10, 10]] > blurred[[10, 12]]);
  }
}
