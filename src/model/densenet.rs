// 该文件是 Radox 项目的一部分。
// src/model/densenet.rs - DenseNet 结构定义与构建
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

use ndarray::{Ix1, Ix2, Ix4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
  network::{BatchNorm2d, Conv2d, Layer, Linear, Network, Node, Pool2d},
  weights::{WeightError, WeightSource},
};

/// 胸片多病种数据集的默认病种顺序
pub const DEFAULT_PATHOLOGIES: [&str; 18] = [
  "Atelectasis",
  "Consolidation",
  "Infiltration",
  "Pneumothorax",
  "Edema",
  "Emphysema",
  "Fibrosis",
  "Effusion",
  "Pneumonia",
  "Pleural_Thickening",
  "Cardiomegaly",
  "Nodule",
  "Mass",
  "Hernia",
  "Lung Lesion",
  "Fracture",
  "Lung Opacity",
  "Enlarged Cardiomediastinum",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
  Sigmoid,
  Softmax,
}

/// DenseNet 结构参数，参数名与 torchvision 的 DenseNet 一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseNetConfig {
  pub name: String,
  pub growth_rate: usize,
  pub block_config: Vec<usize>,
  pub num_init_features: usize,
  pub bn_size: usize,
  pub in_channels: usize,
  pub input_size: usize,
  pub labels: Vec<String>,
  pub output_activation: OutputActivation,
  pub target_label: String,
  pub bn_eps: f32,
}

impl Default for DenseNetConfig {
  fn default() -> Self {
    Self {
      name: "densenet121-res224-all".to_string(),
      growth_rate: 32,
      block_config: vec![6, 12, 24, 16],
      num_init_features: 64,
      bn_size: 4,
      in_channels: 1,
      input_size: 224,
      labels: DEFAULT_PATHOLOGIES.iter().map(|s| s.to_string()).collect(),
      output_activation: OutputActivation::Sigmoid,
      target_label: "Pneumonia".to_string(),
      bn_eps: 1e-5,
    }
  }
}

enum Param {
  Conv { name: String, out: usize, inp: usize, k: usize },
  Norm { name: String, channels: usize },
  Linear { name: String, out: usize, inp: usize },
}

impl DenseNetConfig {
  pub fn num_classes(&self) -> usize {
    self.labels.len()
  }

  pub fn target_index(&self) -> Option<usize> {
    self.labels.iter().position(|l| *l == self.target_label)
  }

  pub fn validate(&self) -> Result<(), WeightError> {
    let invalid = |msg: &str| Err(WeightError::ConfigError(msg.to_string()));
    if self.labels.is_empty() {
      return invalid("类别标签为空");
    }
    if self.block_config.is_empty() || self.block_config.contains(&0) {
      return invalid("稠密块配置无效");
    }
    if self.growth_rate == 0 || self.num_init_features == 0 || self.bn_size == 0 {
      return invalid("增长率、初始特征数与瓶颈倍数必须为正");
    }
    if self.in_channels == 0 || self.input_size == 0 {
      return invalid("输入尺寸必须为正");
    }
    Ok(())
  }

  /// 按网络顺序列出所有参数组
  fn params(&self) -> Vec<Param> {
    let mut params = vec![
      Param::Conv {
        name: "features.conv0".into(),
        out: self.num_init_features,
        inp: self.in_channels,
        k: 7,
      },
      Param::Norm {
        name: "features.norm0".into(),
        channels: self.num_init_features,
      },
    ];
    let bottleneck = self.bn_size * self.growth_rate;
    let mut channels = self.num_init_features;
    for (i, &num_layers) in self.block_config.iter().enumerate() {
      for j in 0..num_layers {
        let prefix = format!("features.denseblock{}.denselayer{}", i + 1, j + 1);
        let inp = channels + j * self.growth_rate;
        params.push(Param::Norm {
          name: format!("{}.norm1", prefix),
          channels: inp,
        });
        params.push(Param::Conv {
          name: format!("{}.conv1", prefix),
          out: bottleneck,
          inp,
          k: 1,
        });
        params.push(Param::Norm {
          name: format!("{}.norm2", prefix),
          channels: bottleneck,
        });
        params.push(Param::Conv {
          name: format!("{}.conv2", prefix),
          out: self.growth_rate,
          inp: bottleneck,
          k: 3,
        });
      }
      channels += num_layers * self.growth_rate;
      if i + 1 != self.block_config.len() {
        let prefix = format!("features.transition{}", i + 1);
        params.push(Param::Norm {
          name: format!("{}.norm", prefix),
          channels,
        });
        params.push(Param::Conv {
          name: format!("{}.conv", prefix),
          out: channels / 2,
          inp: channels,
          k: 1,
        });
        channels /= 2;
      }
    }
    params.push(Param::Norm {
      name: "features.norm5".into(),
      channels,
    });
    params.push(Param::Linear {
      name: "classifier".into(),
      out: self.num_classes(),
      inp: channels,
    });
    params
  }

  /// 权重文件应包含的全部张量名与形状
  pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
    let mut shapes = Vec::new();
    for param in self.params() {
      match param {
        Param::Conv { name, out, inp, k } => shapes.push((format!("{}.weight", name), vec![out, inp, k, k])),
        Param::Norm { name, channels } => {
          for suffix in ["weight", "bias", "running_mean", "running_var"] {
            shapes.push((format!("{}.{}", name, suffix), vec![channels]));
          }
        }
        Param::Linear { name, out, inp } => {
          shapes.push((format!("{}.weight", name), vec![out, inp]));
          shapes.push((format!("{}.bias", name), vec![out]));
        }
      }
    }
    shapes
  }

  /// 从权重构建网络，所有张量的形状都会被校验
  pub fn build(&self, weights: &impl WeightSource) -> Result<Network, WeightError> {
    self.validate()?;
    info!(
      "构建 {}: 增长率 {}, 稠密块 {:?}, {} 个类别",
      self.name,
      self.growth_rate,
      self.block_config,
      self.num_classes()
    );
    let loader = Loader {
      weights,
      eps: self.bn_eps,
    };

    let mut features = vec![
      Node::new("conv0", loader.conv("features.conv0", self.num_init_features, self.in_channels, 7, 2, 3)?),
      Node::new("norm0", loader.norm("features.norm0", self.num_init_features)?),
      Node::new("relu0", Layer::Relu),
      Node::new(
        "pool0",
        Layer::MaxPool2d(Pool2d {
          kernel: 3,
          stride: 2,
          padding: 1,
        }),
      ),
    ];

    let bottleneck = self.bn_size * self.growth_rate;
    let mut channels = self.num_init_features;
    for (i, &num_layers) in self.block_config.iter().enumerate() {
      let mut layers = Vec::with_capacity(num_layers);
      for j in 0..num_layers {
        let prefix = format!("features.denseblock{}.denselayer{}", i + 1, j + 1);
        let inp = channels + j * self.growth_rate;
        let layer = Layer::Sequential(vec![
          Node::new("norm1", loader.norm(&format!("{}.norm1", prefix), inp)?),
          Node::new("relu1", Layer::Relu),
          Node::new("conv1", loader.conv(&format!("{}.conv1", prefix), bottleneck, inp, 1, 1, 0)?),
          Node::new("norm2", loader.norm(&format!("{}.norm2", prefix), bottleneck)?),
          Node::new("relu2", Layer::Relu),
          Node::new(
            "conv2",
            loader.conv(&format!("{}.conv2", prefix), self.growth_rate, bottleneck, 3, 1, 1)?,
          ),
        ]);
        layers.push(Node::new(format!("denselayer{}", j + 1), layer));
      }
      features.push(Node::new(format!("denseblock{}", i + 1), Layer::DenseConcat(layers)));
      channels += num_layers * self.growth_rate;

      if i + 1 != self.block_config.len() {
        let prefix = format!("features.transition{}", i + 1);
        let transition = Layer::Sequential(vec![
          Node::new("norm", loader.norm(&format!("{}.norm", prefix), channels)?),
          Node::new("relu", Layer::Relu),
          Node::new("conv", loader.conv(&format!("{}.conv", prefix), channels / 2, channels, 1, 1, 0)?),
          Node::new(
            "pool",
            Layer::AvgPool2d(Pool2d {
              kernel: 2,
              stride: 2,
              padding: 0,
            }),
          ),
        ]);
        features.push(Node::new(format!("transition{}", i + 1), transition));
        channels /= 2;
      }
    }
    features.push(Node::new("norm5", loader.norm("features.norm5", channels)?));

    let classifier = vec![
      Node::new("relu", Layer::Relu),
      Node::new("avgpool", Layer::GlobalAvgPool),
      Node::new("classifier", loader.linear("classifier", self.num_classes(), channels)?),
    ];

    let network = Network::new(
      features,
      classifier,
      [self.in_channels, self.input_size, self.input_size],
    )?;
    debug!("网络参数量: {}", network.num_parameters());
    Ok(network)
  }
}

struct Loader<'a, W> {
  weights: &'a W,
  eps: f32,
}

impl<W: WeightSource> Loader<'_, W> {
  fn conv(&self, name: &str, out: usize, inp: usize, k: usize, stride: usize, padding: usize) -> Result<Layer, WeightError> {
    let weight = self
      .weights
      .fetch(&format!("{}.weight", name), &[out, inp, k, k])?
      .into_dimensionality::<Ix4>()
      .map_err(|e| WeightError::FormatError(e.to_string()))?;
    Ok(Layer::Conv2d(Conv2d::new(weight, None, stride, padding)?))
  }

  fn vector(&self, name: &str, len: usize) -> Result<ndarray::Array1<f32>, WeightError> {
    self
      .weights
      .fetch(name, &[len])?
      .into_dimensionality::<Ix1>()
      .map_err(|e| WeightError::FormatError(e.to_string()))
  }

  fn norm(&self, name: &str, channels: usize) -> Result<Layer, WeightError> {
    Ok(Layer::BatchNorm2d(BatchNorm2d::new(
      self.vector(&format!("{}.weight", name), channels)?,
      self.vector(&format!("{}.bias", name), channels)?,
      self.vector(&format!("{}.running_mean", name), channels)?,
      self.vector(&format!("{}.running_var", name), channels)?,
      self.eps,
    )?))
  }

  fn linear(&self, name: &str, out: usize, inp: usize) -> Result<Layer, WeightError> {
    let weight = self
      .weights
      .fetch(&format!("{}.weight", name), &[out, inp])?
      .into_dimensionality::<Ix2>()
      .map_err(|e| WeightError::FormatError(e.to_string()))?;
    let bias = self.vector(&format!("{}.bias", name), out)?;
    Ok(Layer::Linear(Linear::new(weight, bias)?))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use ndarray::{ArrayD, IxDyn};
  use std::collections::HashMap;

  /// 三分类、两个稠密块的小网络，32×32 单通道输入
  pub(crate) fn tiny_config() -> DenseNetConfig {
    DenseNetConfig {
      name: "densenet-tiny".to_string(),
      growth_rate: 4,
      block_config: vec![2, 2],
      num_init_features: 8,
      bn_size: 2,
      in_channels: 1,
      input_size: 32,
      labels: vec!["Atelectasis".into(), "Pneumonia".into(), "Effusion".into()],
      output_activation: OutputActivation::Sigmoid,
      target_label: "Pneumonia".to_string(),
      bn_eps: 1e-5,
    }
  }

  /// 按参数名生成确定性的权重
  pub(crate) fn synthetic_weights(config: &DenseNetConfig) -> HashMap<String, ArrayD<f32>> {
    config
      .parameter_shapes()
      .into_iter()
      .enumerate()
      .map(|(k, (name, shape))| {
        let len: usize = shape.iter().product();
        let values: Vec<f32> = if name.ends_with("running_var") {
          vec![1.0; len]
        } else if name.ends_with("running_mean") {
          vec![0.0; len]
        } else if name.contains("norm") && name.ends_with(".weight") {
          vec![1.0; len]
        } else {
          let fan_in = shape.iter().skip(1).product::<usize>().max(1) as f32;
          (0..len)
            .map(|i| ((i as f32 * 0.618 + k as f32 * 1.37).sin()) / fan_in.sqrt())
            .collect()
        };
        let array = ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap();
        (name, array)
      })
      .collect()
  }

  #[test]
  fn default_is_densenet121_with_pneumonia_at_eight() {
    let config = DenseNetConfig::default();
    assert_eq!(config.num_classes(), 18);
    assert_eq!(config.target_index(), Some(8));
    let shapes = config.parameter_shapes();
    assert!(shapes.iter().any(|(n, s)| n == "features.denseblock4.denselayer16.conv2.weight" && s == &vec![32, 128, 3, 3]));
    assert!(shapes.iter().any(|(n, s)| n == "classifier.weight" && s == &vec![18, 1024]));
  }

  #[test]
  fn tiny_network_builds_from_synthetic_weights() {
    let config = tiny_config();
    let network = config.build(&synthetic_weights(&config)).unwrap();
    assert_eq!(network.output_dim(), 3);
    let cam = network.gradcam_layer_index().unwrap();
    assert_eq!(network.layer_name(cam), Some("denseblock2"));
  }

  #[test]
  fn wrong_shape_is_rejected() {
    let config = tiny_config();
    let mut weights = synthetic_weights(&config);
    weights.insert("classifier.bias".to_string(), ArrayD::zeros(IxDyn(&[5])));
    assert!(matches!(
      config.build(&weights),
      Err(WeightError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn config_round_trips_through_json() {
    let json = serde_json::to_string(&tiny_config()).unwrap();
    let parsed: DenseNetConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, tiny_config());
    let partial: DenseNetConfig = serde_json::from_str(r#"{"growth_rate": 16}"#).unwrap();
    assert_eq!(partial.growth_rate, 16);
    assert_eq!(partial.block_config, vec![6, 12, 24, 16]);
  }
}
