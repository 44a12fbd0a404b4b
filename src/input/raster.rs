// 该文件是 Radox 项目的一部分。
// src/input/raster.rs - 常规位图解码 (JPEG/PNG)
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

use ndarray::ArrayD;
use tracing::{debug, error};

use super::{ImageFormat, InputError, cube_from_vec, plane_from_vec};

/// 解码位图；彩色图保留三通道，灰度图返回二维数组
pub(super) fn decode(bytes: &[u8], format: ImageFormat) -> Result<ArrayD<f32>, InputError> {
  let image_format = match format {
    ImageFormat::Jpeg => image::ImageFormat::Jpeg,
    ImageFormat::Png => image::ImageFormat::Png,
    ImageFormat::Dicom => return Err(InputError::UnsupportedFormat("dicom".to_string())),
  };

  let image = image::load_from_memory_with_format(bytes, image_format).map_err(|e| {
    error!("位图解码失败: {}", e);
    InputError::from(e)
  })?;

  let (width, height) = (image.width() as usize, image.height() as usize);
  if width == 0 || height == 0 {
    return Err(InputError::ImageDecodeError("图像尺寸为零".to_string()));
  }

  if image.color().has_color() {
    debug!("彩色位图: {}x{}", width, height);
    let rgb = image.to_rgb8();
    let data = rgb.into_raw().into_iter().map(f32::from).collect();
    Ok(cube_from_vec(height, width, 3, data)?.into_dyn())
  } else {
    debug!("灰度位图: {}x{}", width, height);
    let luma = image.to_luma8();
    let data = luma.into_raw().into_iter().map(f32::from).collect();
    Ok(plane_from_vec(height, width, data)?.into_dyn())
  }
}
