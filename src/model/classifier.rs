// 该文件是 Radox 项目的一部分。
// src/model/classifier.rs - 肺炎分类器
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

use std::{collections::BTreeMap, fmt, path::PathBuf};

use ndarray::{Array1, Array4};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  Model,
  densenet::{DenseNetConfig, OutputActivation},
  network::{Network, NetworkError},
  weights::{MODEL_CONFIG_KEY, SafeTensorWeights},
};
use crate::{
  FromUrl, FromUrlWithScheme,
  explain::{Differentiable, LayerCapture, SaliencyError},
  frame::InputTensor,
};

pub const PNEUMONIA_LABEL: &str = "Neumonía";
pub const NORMAL_LABEL: &str = "Normal";

const DENSENET_SCHEME: &str = "densenet";
const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型尚未加载")]
  ModelNotLoadedError,
  #[error("模型加载错误: {0}")]
  ModelLoadError(String),
  #[error("输入形状不匹配: 期望 {expected:?}，实际 {actual:?}")]
  InputShapeMismatch {
    expected: [usize; 4],
    actual: [usize; 4],
  },
  #[error("推理输出无效: {0}")]
  InferenceError(String),
  #[error("网络错误: {0}")]
  NetworkError(#[from] NetworkError),
}

/// 输出头的解释方式，在加载时确定一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
  /// 对指定输出做 sigmoid 二分类
  Sigmoid(usize),
  /// 对全部输出做 softmax 多分类
  Softmax,
}

impl HeadKind {
  fn resolve(config: &DenseNetConfig, output_dim: usize) -> Result<Self, ModelError> {
    if output_dim == 1 {
      return Ok(HeadKind::Sigmoid(0));
    }
    if output_dim != config.num_classes() {
      return Err(ModelError::ModelLoadError(format!(
        "网络输出维度 {} 与类别数 {} 不一致",
        output_dim,
        config.num_classes()
      )));
    }
    match config.output_activation {
      OutputActivation::Sigmoid => config.target_index().map(HeadKind::Sigmoid).ok_or_else(|| {
        ModelError::ModelLoadError(format!("类别列表中没有目标类别 {}", config.target_label))
      }),
      OutputActivation::Softmax => Ok(HeadKind::Softmax),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
  Loaded,
  AlreadyLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfidenceLevel {
  #[serde(rename = "Muy Alta")]
  MuyAlta,
  #[serde(rename = "Alta")]
  Alta,
  #[serde(rename = "Media")]
  Media,
  #[serde(rename = "Baja")]
  Baja,
  #[serde(rename = "Muy Baja")]
  MuyBaja,
}

impl ConfidenceLevel {
  pub fn from_confidence(confidence: f64) -> Self {
    match confidence {
      c if c >= 0.9 => ConfidenceLevel::MuyAlta,
      c if c >= 0.8 => ConfidenceLevel::Alta,
      c if c >= 0.7 => ConfidenceLevel::Media,
      c if c >= 0.6 => ConfidenceLevel::Baja,
      _ => ConfidenceLevel::MuyBaja,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ConfidenceLevel::MuyAlta => "Muy Alta",
      ConfidenceLevel::Alta => "Alta",
      ConfidenceLevel::Media => "Media",
      ConfidenceLevel::Baja => "Baja",
      ConfidenceLevel::MuyBaja => "Muy Baja",
    }
  }
}

impl fmt::Display for ConfidenceLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathologyScore {
  pub label: String,
  pub probability: f64,
}

/// 按网络输出顺序排列的各病种概率
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct PathologyScores(Vec<PathologyScore>);

impl PathologyScores {
  pub fn get(&self, label: &str) -> Option<f64> {
    self.0.iter().find(|s| s.label == label).map(|s| s.probability)
  }

  pub fn iter(&self) -> impl Iterator<Item = &PathologyScore> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// 概率最高的 `n` 项，降序
  pub fn top(&self, n: usize) -> Vec<&PathologyScore> {
    let mut sorted: Vec<_> = self.0.iter().collect();
    sorted.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    sorted.truncate(n);
    sorted
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
  pub predicted_class: String,
  pub confidence: f64,
  pub confidence_level: ConfidenceLevel,
  pub class_probabilities: BTreeMap<String, f64>,
  pub has_pneumonia: bool,
  pub prob_pneumonia: f64,
  pub pathology_scores: PathologyScores,
  pub raw_predictions: Vec<f32>,
  /// 可解释性引擎使用的输出下标
  #[serde(skip)]
  pub target_index: usize,
  pub recommendation: String,
}

fn sigmoid(x: f64) -> f64 {
  1.0 / (1.0 + (-x).exp())
}

fn softmax(logits: &[f64]) -> Vec<f64> {
  let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
  let sum: f64 = exps.iter().sum();
  exps.into_iter().map(|v| v / sum).collect()
}

fn argmax(values: &[f64]) -> usize {
  values
    .iter()
    .enumerate()
    .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
    .0
}

fn recommendation(has_pneumonia: bool, confidence: f64) -> &'static str {
  match (has_pneumonia, confidence >= 0.8) {
    (true, true) => "Se recomienda evaluación médica inmediata. Los hallazgos sugieren presencia de neumonía.",
    (true, false) => "Se recomienda evaluación médica. Posibles signos de neumonía requieren confirmación.",
    (false, true) => "Radiografía aparenta normalidad. Considerar evaluación clínica si hay síntomas.",
    (false, false) => "Resultado incierto. Se recomienda evaluación médica adicional.",
  }
}

impl Prediction {
  fn from_logits(logits: &Array1<f32>, head: HeadKind, config: &DenseNetConfig) -> Result<Self, ModelError> {
    if logits.iter().any(|v| !v.is_finite()) {
      return Err(ModelError::InferenceError("网络输出包含非有限值".to_string()));
    }
    let raw: Vec<f64> = logits.iter().map(|v| *v as f64).collect();
    let labels: Vec<String> = if raw.len() == config.num_classes() {
      config.labels.clone()
    } else {
      vec![config.target_label.clone()]
    };

    let prediction = match head {
      HeadKind::Sigmoid(index) => {
        let logit = raw.get(index).copied().ok_or_else(|| {
          ModelError::InferenceError(format!("输出下标 {} 超出范围 {}", index, raw.len()))
        })?;
        let p = sigmoid(logit);
        let has_pneumonia = p >= DECISION_THRESHOLD;
        let confidence = if has_pneumonia { p } else { 1.0 - p };
        let class_probabilities = BTreeMap::from([
          (PNEUMONIA_LABEL.to_string(), p),
          (NORMAL_LABEL.to_string(), 1.0 - p),
        ]);
        let scores = labels
          .iter()
          .zip(raw.iter())
          .map(|(label, logit)| PathologyScore {
            label: label.clone(),
            probability: sigmoid(*logit),
          })
          .collect();
        Prediction {
          predicted_class: (if has_pneumonia { PNEUMONIA_LABEL } else { NORMAL_LABEL }).to_string(),
          confidence,
          confidence_level: ConfidenceLevel::from_confidence(confidence),
          class_probabilities,
          has_pneumonia,
          prob_pneumonia: p,
          pathology_scores: PathologyScores(scores),
          raw_predictions: logits.to_vec(),
          target_index: index,
          recommendation: recommendation(has_pneumonia, confidence).to_string(),
        }
      }
      HeadKind::Softmax => {
        let probs = softmax(&raw);
        let best = argmax(&probs);
        let target = config.target_index();
        let has_pneumonia = target == Some(best);
        let confidence = probs[best];
        let scores: Vec<PathologyScore> = labels
          .iter()
          .zip(probs.iter())
          .map(|(label, p)| PathologyScore {
            label: label.clone(),
            probability: *p,
          })
          .collect();
        Prediction {
          predicted_class: labels.get(best).cloned().unwrap_or_default(),
          confidence,
          confidence_level: ConfidenceLevel::from_confidence(confidence),
          class_probabilities: scores.iter().map(|s| (s.label.clone(), s.probability)).collect(),
          has_pneumonia,
          prob_pneumonia: target.and_then(|t| probs.get(t).copied()).unwrap_or(0.0),
          pathology_scores: PathologyScores(scores),
          raw_predictions: logits.to_vec(),
          target_index: target.unwrap_or(best),
          recommendation: recommendation(has_pneumonia, confidence).to_string(),
        }
      }
    };
    Ok(prediction)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
  pub status: &'static str,
  pub architecture: String,
  pub device: &'static str,
  pub num_classes: usize,
  pub input_shape: [usize; 4],
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parameters: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub weights_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierBuilder {
  weights_path: Option<PathBuf>,
  config: DenseNetConfig,
}

impl FromUrlWithScheme for ClassifierBuilder {
  const SCHEME: &'static str = DENSENET_SCHEME;
}

impl FromUrl for ClassifierBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != DENSENET_SCHEME {
      error!("模型 URI 方案不匹配: {}", url.scheme());
      return Err(ModelError::ModelLoadError(format!(
        "模型路径必须使用 {} 方案",
        DENSENET_SCHEME
      )));
    }
    Ok(ClassifierBuilder {
      weights_path: Some(PathBuf::from(url.path())),
      config: DenseNetConfig::default(),
    })
  }
}

impl ClassifierBuilder {
  pub fn weights_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.weights_path = Some(path.into());
    self
  }

  pub fn config(mut self, config: DenseNetConfig) -> Self {
    self.config = config;
    self
  }

  /// 构建未加载的分类器，需随后调用 [`Classifier::load`]
  pub fn build(self) -> Classifier {
    Classifier {
      config: self.config,
      weights_path: self.weights_path,
      loaded: None,
    }
  }
}

#[derive(Debug)]
struct Loaded {
  network: Network,
  head: HeadKind,
}

/// 只读共享的分类器；加载后可在多个请求间以 `&Classifier` 共享
#[derive(Debug)]
pub struct Classifier {
  config: DenseNetConfig,
  weights_path: Option<PathBuf>,
  loaded: Option<Loaded>,
}

impl Classifier {
  pub fn builder() -> ClassifierBuilder {
    ClassifierBuilder::default()
  }

  /// 由已构建的网络直接得到已加载的分类器
  pub fn from_network(network: Network, config: DenseNetConfig) -> Result<Self, ModelError> {
    let head = HeadKind::resolve(&config, network.output_dim())?;
    Ok(Self {
      config,
      weights_path: None,
      loaded: Some(Loaded { network, head }),
    })
  }

  pub fn is_loaded(&self) -> bool {
    self.loaded.is_some()
  }

  pub fn config(&self) -> &DenseNetConfig {
    &self.config
  }

  pub fn head(&self) -> Option<HeadKind> {
    self.loaded.as_ref().map(|l| l.head)
  }

  pub fn network(&self) -> Option<&Network> {
    self.loaded.as_ref().map(|l| &l.network)
  }

  pub fn model_version(&self) -> &str {
    &self.config.name
  }

  /// 读取权重并构建网络；重复调用不会重新加载
  pub fn load(&mut self) -> Result<LoadState, ModelError> {
    if self.loaded.is_some() {
      debug!("模型已加载，跳过");
      return Ok(LoadState::AlreadyLoaded);
    }
    let path = self
      .weights_path
      .clone()
      .ok_or_else(|| ModelError::ModelLoadError("未指定权重文件".to_string()))?;

    let weights = SafeTensorWeights::from_file(&path).map_err(|e| {
      error!("读取权重失败: {}", e);
      ModelError::ModelLoadError(e.to_string())
    })?;

    let (config, network) = match self.config.build(&weights) {
      Ok(network) => (self.config.clone(), network),
      Err(first) => {
        warn!("按配置构建网络失败: {}，尝试权重文件内嵌的结构", first);
        let embedded = weights.metadata(MODEL_CONFIG_KEY).ok_or_else(|| {
          ModelError::ModelLoadError(format!("{}; 权重文件没有内嵌网络结构", first))
        })?;
        let config: DenseNetConfig = serde_json::from_str(embedded).map_err(|e| {
          ModelError::ModelLoadError(format!("{}; 内嵌网络结构解析失败: {}", first, e))
        })?;
        let network = config.build(&weights).map_err(|second| {
          error!("内嵌网络结构同样无法构建: {}", second);
          ModelError::ModelLoadError(format!("{}; {}", first, second))
        })?;
        (config, network)
      }
    };

    let head = HeadKind::resolve(&config, network.output_dim())?;
    info!(
      "模型加载完成: {} ({:?}, {} 个参数)",
      config.name,
      head,
      network.num_parameters()
    );
    self.config = config;
    self.loaded = Some(Loaded { network, head });
    Ok(LoadState::Loaded)
  }

  fn loaded(&self) -> Result<&Loaded, ModelError> {
    self.loaded.as_ref().ok_or(ModelError::ModelNotLoadedError)
  }

  fn check_input(&self, network: &Network, input: &InputTensor) -> Result<(), ModelError> {
    let [c, h, w] = network.input_shape();
    let expected = [1, c, h, w];
    if input.shape() != expected {
      return Err(ModelError::InputShapeMismatch {
        expected,
        actual: input.shape(),
      });
    }
    Ok(())
  }

  /// 单次前向推理，不保留任何中间结果
  pub fn predict(&self, input: &InputTensor) -> Result<Prediction, ModelError> {
    let loaded = self.loaded()?;
    self.check_input(&loaded.network, input)?;
    let logits = loaded.network.forward(input)?;
    let prediction = Prediction::from_logits(&logits, loaded.head, &self.config)?;
    info!(
      "预测: {} (置信度 {:.3}, 肺炎概率 {:.3})",
      prediction.predicted_class, prediction.confidence, prediction.prob_pneumonia
    );
    Ok(prediction)
  }

  pub fn model_info(&self) -> ModelInfo {
    let [c, h, w] = self
      .network()
      .map(|n| n.input_shape())
      .unwrap_or([self.config.in_channels, self.config.input_size, self.config.input_size]);
    ModelInfo {
      status: if self.is_loaded() { "loaded" } else { "not_loaded" },
      architecture: self.config.name.clone(),
      device: "cpu",
      num_classes: self.config.num_classes(),
      input_shape: [1, c, h, w],
      parameters: self.network().map(Network::num_parameters),
      weights_path: self.weights_path.as_ref().map(|p| p.display().to_string()),
    }
  }
}

impl Model for Classifier {
  type Input = InputTensor;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.predict(input)
  }
}

impl Differentiable for Classifier {
  fn gradcam_layer(&self) -> Option<String> {
    self.network().and_then(Differentiable::gradcam_layer)
  }

  fn capture_layer(&self, input: &InputTensor, layer: &str, target: usize) -> Result<LayerCapture, SaliencyError> {
    let loaded = self.loaded()?;
    self.check_input(&loaded.network, input)?;
    loaded.network.capture_layer(input, layer, target)
  }

  fn input_gradient(&self, input: &InputTensor, target: usize) -> Result<Array4<f32>, SaliencyError> {
    let loaded = self.loaded()?;
    self.check_input(&loaded.network, input)?;
    Differentiable::input_gradient(&loaded.network, input, target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::testing::{synthetic_weights, tiny_config};
  use std::collections::HashMap;

  fn loaded_classifier() -> Classifier {
    let config = tiny_config();
    let network = config.build(&synthetic_weights(&config)).unwrap();
    Classifier::from_network(network, config).unwrap()
  }

  fn input(value: f32) -> InputTensor {
    InputTensor::try_from(Array4::from_elem((1, 1, 32, 32), value)).unwrap()
  }

  fn write_weights(config: &DenseNetConfig, embed: Option<&DenseNetConfig>) -> tempfile::NamedTempFile {
    let metadata = embed.map(|c| HashMap::from([(MODEL_CONFIG_KEY.to_string(), serde_json::to_string(c).unwrap())]));
    let bytes = SafeTensorWeights::serialize(synthetic_weights(config), metadata).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), bytes).unwrap();
    file
  }

  #[test]
  fn predict_is_idempotent() {
    let classifier = loaded_classifier();
    let a = classifier.predict(&input(0.3)).unwrap();
    let b = classifier.predict(&input(0.3)).unwrap();
    assert_eq!(a.raw_predictions, b.raw_predictions);
    assert_eq!(a.predicted_class, b.predicted_class);
    assert_eq!(a.confidence, b.confidence);
  }

  #[test]
  fn probabilities_stay_in_range_and_sum_to_one() {
    let classifier = loaded_classifier();
    for value in [-3.0, 0.0, 2.5] {
      let p = classifier.predict(&input(value)).unwrap();
      assert!((0.5..=1.0).contains(&p.confidence));
      let pneumonia = p.class_probabilities[PNEUMONIA_LABEL];
      let normal = p.class_probabilities[NORMAL_LABEL];
      assert!((0.0..=1.0).contains(&pneumonia));
      assert!((pneumonia + normal - 1.0).abs() <= f64::EPSILON);
      assert_eq!(p.target_index, 1);
      assert_eq!(p.pathology_scores.len(), 3);
      assert_eq!(p.pathology_scores.get("Pneumonia"), Some(pneumonia));
    }
  }

  #[test]
  fn unloaded_classifier_refuses_to_predict() {
    let classifier = Classifier::builder().config(tiny_config()).build();
    assert!(matches!(
      classifier.predict(&input(0.0)),
      Err(ModelError::ModelNotLoadedError)
    ));
    assert_eq!(classifier.model_info().status, "not_loaded");
  }

  #[test]
  fn wrong_input_shape_is_rejected() {
    let classifier = loaded_classifier();
    let tensor = InputTensor::try_from(Array4::zeros((1, 1, 16, 16))).unwrap();
    assert!(matches!(
      classifier.predict(&tensor),
      Err(ModelError::InputShapeMismatch { .. })
    ));
  }

  #[test]
  fn second_load_is_a_no_op() {
    let config = tiny_config();
    let file = write_weights(&config, None);
    let mut classifier = Classifier::builder().config(config).weights_path(file.path()).build();
    assert_eq!(classifier.load().unwrap(), LoadState::Loaded);
    let first = classifier.predict(&input(1.0)).unwrap();
    assert_eq!(classifier.load().unwrap(), LoadState::AlreadyLoaded);
    let second = classifier.predict(&input(1.0)).unwrap();
    assert_eq!(first.raw_predictions, second.raw_predictions);
    assert_eq!(classifier.model_info().status, "loaded");
  }

  #[test]
  fn falls_back_to_embedded_architecture() {
    let config = tiny_config();
    let file = write_weights(&config, Some(&config));
    let mut classifier = Classifier::builder()
      .config(DenseNetConfig::default())
      .weights_path(file.path())
      .build();
    assert_eq!(classifier.load().unwrap(), LoadState::Loaded);
    assert_eq!(classifier.model_version(), "densenet-tiny");
    assert_eq!(classifier.head(), Some(HeadKind::Sigmoid(1)));
  }

  #[test]
  fn missing_embedded_architecture_reports_both_causes() {
    let config = tiny_config();
    let file = write_weights(&config, None);
    let mut classifier = Classifier::builder().weights_path(file.path()).build();
    let err = classifier.load().unwrap_err();
    assert!(matches!(err, ModelError::ModelLoadError(_)));
    assert!(!classifier.is_loaded());
  }

  #[test]
  fn softmax_head_uses_argmax() {
    let config = DenseNetConfig {
      output_activation: OutputActivation::Softmax,
      ..tiny_config()
    };
    let logits = Array1::from(vec![0.1_f32, 2.0, -1.0]);
    let p = Prediction::from_logits(&logits, HeadKind::Softmax, &config).unwrap();
    assert_eq!(p.predicted_class, "Pneumonia");
    assert!(p.has_pneumonia);
    let total: f64 = p.class_probabilities.values().sum();
    assert!((total - 1.0).abs() < 1e-12);
    assert_eq!(p.confidence, p.prob_pneumonia);
  }

  #[test]
  fn single_output_is_sigmoid_head() {
    let config = DenseNetConfig {
      labels: vec!["Pneumonia".into()],
      output_activation: OutputActivation::Softmax,
      ..tiny_config()
    };
    assert_eq!(HeadKind::resolve(&config, 1).unwrap(), HeadKind::Sigmoid(0));
    let p = Prediction::from_logits(&Array1::from(vec![-2.0_f32]), HeadKind::Sigmoid(0), &config).unwrap();
    assert_eq!(p.predicted_class, NORMAL_LABEL);
    assert!(p.confidence > 0.8);
  }

  #[test]
  fn confidence_levels() {
    assert_eq!(ConfidenceLevel::from_confidence(0.95), ConfidenceLevel::MuyAlta);
    assert_eq!(ConfidenceLevel::from_confidence(0.8), ConfidenceLevel::Alta);
    assert_eq!(ConfidenceLevel::from_confidence(0.55).to_string(), "Muy Baja");
  }

  #[test]
  fn builder_from_url() {
    let url = Url::parse("densenet:///opt/models/densenet121.safetensors").unwrap();
    let classifier = ClassifierBuilder::from_url(&url).unwrap().build();
    assert_eq!(
      classifier.model_info().weights_path.as_deref(),
      Some("/opt/models/densenet121.safetensors")
    );
    assert!(ClassifierBuilder::from_url(&Url::parse("yolo:///x").unwrap()).is_err());
  }
}
