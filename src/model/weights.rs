// 该文件是 Radox 项目的一部分。
// src/model/weights.rs - safetensors 权重读取
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

use std::{collections::HashMap, path::Path};

use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use thiserror::Error;
use tracing::{debug, info};

use super::network::NetworkError;

/// 权重文件元数据中存放网络结构 JSON 的键
pub const MODEL_CONFIG_KEY: &str = "model_config";

#[derive(Error, Debug)]
pub enum WeightError {
  #[error("权重文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("权重文件格式错误: {0}")]
  FormatError(String),
  #[error("缺少权重: {0}")]
  MissingTensor(String),
  #[error("权重 {name} 形状不符: 期望 {expected:?}，实际 {actual:?}")]
  ShapeMismatch {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("权重 {name} 的数据类型 {dtype} 不受支持")]
  UnsupportedDtype { name: String, dtype: String },
  #[error("网络结构无效: {0}")]
  ConfigError(String),
  #[error("网络构建错误: {0}")]
  NetworkError(#[from] NetworkError),
}

impl From<safetensors::SafeTensorError> for WeightError {
  fn from(err: safetensors::SafeTensorError) -> Self {
    WeightError::FormatError(err.to_string())
  }
}

/// 按参数名提供 f32 权重
pub trait WeightSource {
  fn get(&self, name: &str) -> Option<&ArrayD<f32>>;

  /// 取出权重并校验形状
  fn fetch(&self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError> {
    let tensor = self
      .get(name)
      .ok_or_else(|| WeightError::MissingTensor(name.to_string()))?;
    if tensor.shape() != shape {
      return Err(WeightError::ShapeMismatch {
        name: name.to_string(),
        expected: shape.to_vec(),
        actual: tensor.shape().to_vec(),
      });
    }
    Ok(tensor.clone())
  }
}

impl WeightSource for HashMap<String, ArrayD<f32>> {
  fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
    HashMap::get(self, name)
  }
}

/// 一次性解码到内存的 safetensors 权重
#[derive(Debug, Clone, Default)]
pub struct SafeTensorWeights {
  tensors: HashMap<String, ArrayD<f32>>,
  metadata: HashMap<String, String>,
}

impl WeightSource for SafeTensorWeights {
  fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
    self.tensors.get(name)
  }
}

impl SafeTensorWeights {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WeightError> {
    let path = path.as_ref();
    info!("读取权重文件: {}", path.display());
    let bytes = std::fs::read(path)?;
    debug!(
      "权重文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );
    Self::from_bytes(&bytes)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, WeightError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let st = SafeTensors::deserialize(bytes)?;

    let mut tensors = HashMap::new();
    for (name, view) in st.tensors() {
      let values = decode_values(&name, view.dtype(), view.data())?;
      let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
        .map_err(|e| WeightError::FormatError(format!("{}: {}", name, e)))?;
      tensors.insert(name, array);
    }
    debug!("共解码 {} 个权重张量", tensors.len());
    Ok(Self { tensors, metadata })
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  pub fn metadata(&self, key: &str) -> Option<&str> {
    self.metadata.get(key).map(String::as_str)
  }

  /// 将 f32 张量写为 safetensors 字节
  pub fn serialize<I>(tensors: I, metadata: Option<HashMap<String, String>>) -> Result<Vec<u8>, WeightError>
  where
    I: IntoIterator<Item = (String, ArrayD<f32>)>,
  {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
      .into_iter()
      .map(|(name, array)| {
        let shape = array.shape().to_vec();
        let bytes = array.iter().flat_map(|v| v.to_le_bytes()).collect();
        (name, shape, bytes)
      })
      .collect();
    let views = encoded
      .iter()
      .map(|(name, shape, bytes)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
      .collect::<Result<Vec<_>, WeightError>>()?;
    Ok(safetensors::serialize(views, &metadata)?)
  }
}

fn decode_values(name: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f32>, WeightError> {
  let values = match dtype {
    Dtype::F32 => data
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect(),
    Dtype::F64 => data
      .chunks_exact(8)
      .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
      .collect(),
    Dtype::F16 => data
      .chunks_exact(2)
      .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
      .collect(),
    Dtype::BF16 => data
      .chunks_exact(2)
      .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
      .collect(),
    other => {
      return Err(WeightError::UnsupportedDtype {
        name: name.to_string(),
        dtype: format!("{:?}", other),
      });
    }
  };
  Ok(values)
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  #[test]
  fn half_precision_tensors_are_widened() {
    let halves: Vec<u8> = [1.0_f32, -2.0, 0.5, 0.0]
      .into_iter()
      .flat_map(|v| f16::from_f32(v).to_le_bytes())
      .collect();
    let brains: Vec<u8> = [1.0_f32, -2.0, 0.5, 3.0]
      .into_iter()
      .flat_map(|v| bf16::from_f32(v).to_le_bytes())
      .collect();
    let views = [
      ("h", TensorView::new(Dtype::F16, vec![2, 2], &halves).unwrap()),
      ("b", TensorView::new(Dtype::BF16, vec![4], &brains).unwrap()),
    ];
    let bytes = safetensors::serialize(views, &None).unwrap();

    let weights = SafeTensorWeights::from_bytes(&bytes).unwrap();
    assert_eq!(weights.fetch("h", &[2, 2]).unwrap(), array![[1.0_f32, -2.0], [0.5, 0.0]].into_dyn());
    assert_eq!(weights.fetch("b", &[4]).unwrap(), array![1.0_f32, -2.0, 0.5, 3.0].into_dyn());
  }

  #[test]
  fn integer_tensors_are_rejected() {
    let data = [0_u8; 4];
    assert!(matches!(
      decode_values("i", Dtype::I32, &data),
      Err(WeightError::UnsupportedDtype { .. })
    ));
  }

  #[test]
  fn serialized_weights_load_back() {
    let mut metadata = HashMap::new();
    metadata.insert(MODEL_CONFIG_KEY.to_string(), "{}".to_string());
    let bytes = SafeTensorWeights::serialize(
      [
        ("a.weight".to_string(), array![[1.0_f32, 2.0], [3.0, 4.0]].into_dyn()),
        ("a.bias".to_string(), array![0.5_f32, -0.5].into_dyn()),
      ],
      Some(metadata),
    )
    .unwrap();

    let weights = SafeTensorWeights::from_bytes(&bytes).unwrap();
    assert_eq!(weights.len(), 2);
    assert_eq!(weights.metadata(MODEL_CONFIG_KEY), Some("{}"));
    let w = weights.fetch("a.weight", &[2, 2]).unwrap();
    assert_eq!(w[[1, 0]], 3.0);
    assert!(matches!(
      weights.fetch("a.weight", &[4]),
      Err(WeightError::ShapeMismatch { .. })
    ));
    assert!(matches!(
      weights.fetch("missing", &[1]),
      Err(WeightError::MissingTensor(_))
    ));
  }

  #[test]
  fn garbage_is_format_error() {
    assert!(matches!(
      SafeTensorWeights::from_bytes(b"definitely not safetensors"),
      Err(WeightError::FormatError(_))
    ));
  }
}
