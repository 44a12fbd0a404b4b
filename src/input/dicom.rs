// 该文件是 Radox 项目的一部分。
// src/input/dicom.rs - DICOM 解析、窗宽窗位与元数据提取
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

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, from_reader};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{InputError, apply_window, cube_from_vec, normalize_to_u8_range, plane_from_vec};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

/// 原样透传给上层的 DICOM 元数据，缺失的字段不序列化
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DicomMetadata {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_age: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_sex: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub study_date: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub study_time: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub modality: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub institution: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub manufacturer: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body_part: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub view_position: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image_size: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty", default)]
  pub pixel_spacing: Vec<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub slice_thickness: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub kvp: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exposure_time: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub window_center: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub window_width: Option<f64>,
}

/// 像素解码所需的图像属性
#[derive(Debug, Clone)]
struct PixelModule {
  rows: usize,
  columns: usize,
  samples_per_pixel: usize,
  planar_configuration: u16,
  bits_allocated: u16,
  signed: bool,
  photometric: String,
  rescale_slope: f64,
  rescale_intercept: f64,
  window: Option<(f64, f64)>,
}

/// 定位 "DICM" 魔数：允许 128 字节前导区，也允许没有前导区
fn strip_preamble(bytes: &[u8]) -> Result<&[u8], InputError> {
  if bytes.len() >= PREAMBLE_LEN + MAGIC.len()
    && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] == MAGIC
  {
    Ok(&bytes[PREAMBLE_LEN..])
  } else if bytes.starts_with(MAGIC) {
    Ok(bytes)
  } else {
    Err(InputError::ImageDecodeError("缺少 DICM 魔数".to_string()))
  }
}

fn open(bytes: &[u8]) -> Result<DefaultDicomObject, InputError> {
  let body = strip_preamble(bytes)?;
  from_reader(body).map_err(|e| {
    error!("DICOM 解析失败: {}", e);
    InputError::ImageDecodeError(e.to_string())
  })
}

fn read_str(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
  let elem = obj.element(tag).ok()?;
  let value = elem.to_str().ok()?;
  let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
  (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn read_u16(obj: &DefaultDicomObject, tag: Tag) -> Option<u16> {
  obj.element(tag).ok()?.to_int::<u16>().ok()
}

/// 多值 DS 取第一个值
fn read_first_f64(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
  obj
    .element(tag)
    .ok()?
    .to_multi_float64()
    .ok()?
    .into_iter()
    .next()
    .filter(|v| v.is_finite())
}

fn read_pixel_module(obj: &DefaultDicomObject) -> Result<PixelModule, InputError> {
  let required = |tag: Tag, name: &str| {
    read_u16(obj, tag).ok_or_else(|| InputError::ImageDecodeError(format!("缺少必需字段 {}", name)))
  };

  let rows = required(tags::ROWS, "Rows")? as usize;
  let columns = required(tags::COLUMNS, "Columns")? as usize;
  let bits_allocated = read_u16(obj, tags::BITS_ALLOCATED).unwrap_or(16);
  let signed = read_u16(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;
  let samples_per_pixel = read_u16(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1) as usize;
  let planar_configuration = read_u16(obj, tags::PLANAR_CONFIGURATION).unwrap_or(0);
  let photometric =
    read_str(obj, tags::PHOTOMETRIC_INTERPRETATION).unwrap_or_else(|| "MONOCHROME2".to_string());

  let rescale_slope = read_first_f64(obj, tags::RESCALE_SLOPE)
    .filter(|s| *s != 0.0)
    .unwrap_or(1.0);
  let rescale_intercept = read_first_f64(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0);

  let window = match (
    read_first_f64(obj, tags::WINDOW_CENTER),
    read_first_f64(obj, tags::WINDOW_WIDTH),
  ) {
    (Some(center), Some(width)) if width > 0.0 => Some((center, width)),
    (Some(_), Some(width)) => {
      warn!("窗宽 {} 非正，忽略窗宽窗位", width);
      None
    }
    _ => None,
  };

  if rows == 0 || columns == 0 {
    return Err(InputError::ImageDecodeError(format!(
      "图像尺寸无效: {}x{}",
      rows, columns
    )));
  }
  if samples_per_pixel != 1 && samples_per_pixel != 3 {
    return Err(InputError::ImageDecodeError(format!(
      "不支持的 SamplesPerPixel: {}",
      samples_per_pixel
    )));
  }

  Ok(PixelModule {
    rows,
    columns,
    samples_per_pixel,
    planar_configuration,
    bits_allocated,
    signed,
    photometric,
    rescale_slope,
    rescale_intercept,
    window,
  })
}

/// 按位深和符号将小端字节序列解码为样本值
fn decode_samples(raw: &[u8], module: &PixelModule, count: usize) -> Result<Vec<f64>, InputError> {
  let width = match module.bits_allocated {
    8 => 1,
    16 => 2,
    32 => 4,
    other => {
      return Err(InputError::ImageDecodeError(format!(
        "不支持的 BitsAllocated: {}",
        other
      )));
    }
  };
  if raw.len() < count * width {
    return Err(InputError::ImageDecodeError(format!(
      "像素数据长度不足: 需要 {} 字节，实际 {} 字节",
      count * width,
      raw.len()
    )));
  }

  let samples = raw[..count * width].chunks_exact(width).map(|c| match (width, module.signed) {
    (1, false) => c[0] as f64,
    (1, true) => c[0] as i8 as f64,
    (2, false) => u16::from_le_bytes([c[0], c[1]]) as f64,
    (2, true) => i16::from_le_bytes([c[0], c[1]]) as f64,
    (_, false) => u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
    (_, true) => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
  });
  Ok(samples.collect())
}

/// 平面存储 (RRR..GGG..BBB) 转为交错存储 (RGBRGB..)
fn interleave(planar: Vec<f64>, pixels: usize, channels: usize) -> Vec<f64> {
  let mut out = vec![0.0; planar.len()];
  for c in 0..channels {
    for p in 0..pixels {
      out[p * channels + c] = planar[c * pixels + p];
    }
  }
  out
}

/// 解码 DICOM 字节为 0–255 的数组
pub(super) fn decode(bytes: &[u8]) -> Result<ArrayD<f32>, InputError> {
  let obj = open(bytes)?;
  let module = read_pixel_module(&obj)?;
  debug!("DICOM 像素模块: {:?}", module);

  let pixel_data = obj
    .element(tags::PIXEL_DATA)
    .map_err(|e| InputError::ImageDecodeError(format!("缺少像素数据: {}", e)))?;
  let primitive = pixel_data.value().primitive().ok_or_else(|| {
    InputError::ImageDecodeError("不支持封装（压缩）的像素数据".to_string())
  })?;
  let raw = primitive.to_bytes();

  let pixels = module.rows * module.columns;
  let count = pixels * module.samples_per_pixel;
  let mut values = decode_samples(&raw, &module, count)?;

  if module.samples_per_pixel == 3 && module.planar_configuration == 1 {
    values = interleave(values, pixels, 3);
  }

  if module.rescale_slope != 1.0 || module.rescale_intercept != 0.0 {
    for v in values.iter_mut() {
      *v = *v * module.rescale_slope + module.rescale_intercept;
    }
  }

  let mut mapped = match module.window {
    Some((center, width)) => {
      debug!("应用窗宽窗位: center={}, width={}", center, width);
      apply_window(&values, center, width)
    }
    None if module.bits_allocated != 8 => normalize_to_u8_range(&values),
    None => values.iter().map(|v| v.clamp(0.0, 255.0) as f32).collect(),
  };

  if module.photometric == "MONOCHROME1" {
    for v in mapped.iter_mut() {
      *v = 255.0 - *v;
    }
  }

  info!(
    "DICOM 图像解码完成: {}x{}x{}, {} 位",
    module.rows, module.columns, module.samples_per_pixel, module.bits_allocated
  );

  if module.samples_per_pixel == 1 {
    Ok(plane_from_vec(module.rows, module.columns, mapped)?.into_dyn())
  } else {
    Ok(cube_from_vec(module.rows, module.columns, 3, mapped)?.into_dyn())
  }
}

/// 提取 DICOM 元数据；无法解析时返回 None
pub fn extract_dicom_metadata(bytes: &[u8]) -> Option<DicomMetadata> {
  let obj = match open(bytes) {
    Ok(obj) => obj,
    Err(e) => {
      warn!("提取 DICOM 元数据失败: {}", e);
      return None;
    }
  };

  let image_size = match (read_u16(&obj, tags::ROWS), read_u16(&obj, tags::COLUMNS)) {
    (Some(rows), Some(cols)) => Some(format!("{}x{}", rows, cols)),
    _ => None,
  };
  let pixel_spacing = obj
    .element(tags::PIXEL_SPACING)
    .ok()
    .and_then(|e| e.to_multi_float64().ok())
    .unwrap_or_default();

  let metadata = DicomMetadata {
    patient_id: read_str(&obj, tags::PATIENT_ID),
    patient_name: read_str(&obj, tags::PATIENT_NAME),
    patient_age: read_str(&obj, tags::PATIENT_AGE),
    patient_sex: read_str(&obj, tags::PATIENT_SEX),
    study_date: read_str(&obj, tags::STUDY_DATE),
    study_time: read_str(&obj, tags::STUDY_TIME),
    modality: read_str(&obj, tags::MODALITY),
    institution: read_str(&obj, tags::INSTITUTION_NAME),
    manufacturer: read_str(&obj, tags::MANUFACTURER),
    model: read_str(&obj, tags::MANUFACTURER_MODEL_NAME),
    body_part: read_str(&obj, tags::BODY_PART_EXAMINED),
    view_position: read_str(&obj, tags::VIEW_POSITION),
    image_size,
    pixel_spacing,
    slice_thickness: read_first_f64(&obj, tags::SLICE_THICKNESS),
    kvp: read_first_f64(&obj, tags::KVP),
    exposure_time: read_first_f64(&obj, tags::EXPOSURE_TIME),
    window_center: read_first_f64(&obj, tags::WINDOW_CENTER),
    window_width: read_first_f64(&obj, tags::WINDOW_WIDTH),
  };
  info!("DICOM 元数据提取完成");
  Some(metadata)
}
