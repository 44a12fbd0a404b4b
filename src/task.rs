// 该文件是 Radox 项目的一部分。
// src/task.rs - 病例组装与任务执行
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

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  config::DetectorConfig,
  explain::{Differentiable, Explainer, SaliencyError, SaliencyMethod},
  frame::InputTensor,
  input::{Channels, DicomMetadata, ImageFormat, InputError, RawImage, extract_dicom_metadata, ingest},
  model::{Classifier, Model, ModelError, Prediction},
  output::Render,
  preprocess::{PreprocessError, Preprocessor},
};

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("输入错误: {0}")]
  InputError(#[from] InputError),
  #[error("预处理错误: {0}")]
  PreprocessError(#[from] PreprocessError),
  #[error("模型错误: {0}")]
  ModelError(#[from] ModelError),
}

impl DetectError {
  /// 由请求本身引起，重试无意义
  pub fn is_client_error(&self) -> bool {
    match self {
      DetectError::InputError(e) => !matches!(e, InputError::IoError(_)),
      DetectError::PreprocessError(_) => true,
      DetectError::ModelError(_) => false,
    }
  }

  /// 服务端暂时不可用，可稍后重试
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      DetectError::ModelError(ModelError::ModelNotLoadedError) | DetectError::InputError(InputError::IoError(_))
    )
  }
}

/// 调用方随影像一同提交的临床信息，原样写入病例摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientInfo {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub age: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub gender: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub symptoms: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub clinical_history: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
  #[serde(rename = "ninguna")]
  None,
  #[serde(rename = "leve")]
  Mild,
  #[serde(rename = "moderada")]
  Moderate,
  #[serde(rename = "alta")]
  High,
}

impl Severity {
  pub fn assess(has_pneumonia: bool, confidence: f64) -> Self {
    match (has_pneumonia, confidence) {
      (false, _) => Severity::None,
      (true, c) if c >= 0.9 => Severity::High,
      (true, c) if c >= 0.8 => Severity::Moderate,
      _ => Severity::Mild,
    }
  }

  fn findings(&self) -> &'static [&'static str] {
    match self {
      Severity::None => &["Campos pulmonares limpios, sin signos de consolidación o infiltrados"],
      Severity::High => &[
        "Consolidación pulmonar evidente",
        "Broncograma aéreo visible",
        "Opacidades densas con límites definidos",
        "Probable derrame pleural asociado",
      ],
      Severity::Moderate => &[
        "Infiltrados pulmonares parcheados",
        "Opacidades de densidad intermedia",
        "Patrón alveolar focal",
        "Engrosamiento intersticial",
      ],
      Severity::Mild => &[
        "Opacidades sutiles en vidrio esmerilado",
        "Infiltrados intersticiales mínimos",
        "Cambios inflamatorios incipientes",
        "Patrón reticular fino",
      ],
    }
  }
}

/// 供报告生成使用的病例摘要
#[derive(Debug, Clone, Serialize)]
pub struct CaseSummary {
  pub diagnosis: String,
  pub confidence: f64,
  pub severity: Severity,
  pub findings: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub age: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub gender: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub symptoms: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub clinical_history: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_age: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_sex: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub study_date: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub modality: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub view_position: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body_part: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub institution: Option<String>,
}

impl CaseSummary {
  pub fn new(prediction: &Prediction, patient: Option<&PatientInfo>, dicom: Option<&DicomMetadata>) -> Self {
    let confidence = prediction.confidence;
    let diagnosis = match (prediction.has_pneumonia, confidence) {
      (true, c) if c >= 0.9 => "Neumonía probable",
      (true, c) if c < 0.7 => "Neumonía posible",
      (true, _) => "Neumonía",
      (false, _) => "Normal",
    };
    let severity = Severity::assess(prediction.has_pneumonia, confidence);

    let mut findings: Vec<&str> = severity.findings().to_vec();
    if prediction.has_pneumonia && confidence < 0.8 {
      findings.push("Hallazgos requieren correlación clínica");
    }

    let patient = patient.cloned().unwrap_or_default();
    let dicom = dicom.cloned().unwrap_or_default();
    Self {
      diagnosis: diagnosis.to_string(),
      confidence,
      severity,
      findings: format!("{}.", findings.join(". ")),
      age: patient.age,
      gender: patient.gender,
      symptoms: patient.symptoms,
      clinical_history: patient.clinical_history,
      patient_id: dicom.patient_id,
      patient_age: dicom.patient_age,
      patient_sex: dicom.patient_sex,
      study_date: dicom.study_date,
      modality: dicom.modality,
      view_position: dicom.view_position,
      body_part: dicom.body_part,
      institution: dicom.institution,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingInfo {
  pub image_format: ImageFormat,
  pub model_version: String,
  pub has_dicom_metadata: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub heatmap_method: Option<SaliencyMethod>,
  /// Grad-CAM 退化后改用输入梯度
  pub heatmap_fallback: bool,
  pub processing_time_ms: f64,
}

/// 一次检测的完整结果，序列化后即为对外的响应体
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
  pub case_id: String,
  pub timestamp: DateTime<Utc>,
  pub filename: String,
  #[serde(flatten)]
  pub prediction: Prediction,
  pub heatmap: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dicom_metadata: Option<DicomMetadata>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patient_info: Option<PatientInfo>,
  pub summary: CaseSummary,
  pub processing_info: ProcessingInfo,
  /// 未编码的叠加图，供输出端保存
  #[serde(skip)]
  pub overlay: Option<RgbImage>,
}

pub trait WithLabel {
  fn label(&self) -> &str;
}

impl WithLabel for Prediction {
  fn label(&self) -> &str {
    &self.predicted_class
  }
}

impl WithLabel for DetectionResult {
  fn label(&self) -> &str {
    &self.prediction.predicted_class
  }
}

fn new_case_id() -> String {
  let id = Uuid::new_v4().simple().to_string();
  format!("case_{}", &id[..8])
}

/// 串联摄取、预处理、分类与可解释性的检测流程
pub struct DetectTask<'a, M> {
  model: &'a M,
  model_version: String,
  preprocessor: Preprocessor,
  explainer: Explainer,
}

impl<'a> DetectTask<'a, Classifier> {
  /// 预处理的目标尺寸与通道数以分类器声明的输入为准
  pub fn from_config(classifier: &'a Classifier, config: &DetectorConfig) -> Self {
    let [channels, height, width] = match classifier.network() {
      Some(network) => network.input_shape(),
      None => {
        let declared = classifier.config();
        [declared.in_channels, declared.input_size, declared.input_size]
      }
    };
    let mut preprocess = config.preprocess.clone();
    if (preprocess.channels, preprocess.height, preprocess.width) != (channels, height, width) {
      warn!(
        "预处理尺寸 {}x{}x{} 与网络输入 {}x{}x{} 不符，改用网络声明的尺寸",
        preprocess.channels, preprocess.height, preprocess.width, channels, height, width
      );
      preprocess.channels = channels;
      preprocess.height = height;
      preprocess.width = width;
    }

    DetectTask::new(
      classifier,
      Preprocessor::new(preprocess),
      Explainer::new(config.explain.clone()),
    )
    .with_model_version(classifier.model_version())
  }
}

impl<'a, M> DetectTask<'a, M>
where
  M: Model<Input = InputTensor, Output = Prediction, Error = ModelError> + Differentiable,
{
  pub fn new(model: &'a M, preprocessor: Preprocessor, explainer: Explainer) -> Self {
    Self {
      model,
      model_version: "unknown".to_string(),
      preprocessor,
      explainer,
    }
  }

  pub fn preprocessor(&self) -> &Preprocessor {
    &self.preprocessor
  }

  pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
    self.model_version = version.into();
    self
  }

  pub fn detect(&self, raw: &RawImage, patient: Option<PatientInfo>) -> Result<DetectionResult, DetectError> {
    let started = Instant::now();
    let format = raw.format()?;
    let channels = Channels::from_count(self.preprocessor.config().channels).ok_or_else(|| {
      PreprocessError::InvalidImageShapeError(format!(
        "不支持的网络输入通道数: {}",
        self.preprocessor.config().channels
      ))
    })?;

    let image = ingest(raw, channels)?;
    let dicom_metadata = match format {
      ImageFormat::Dicom => extract_dicom_metadata(raw.bytes()),
      _ => None,
    };
    let (tensor, region) = self.preprocessor.process_with_region(&image)?;
    let prediction = self.model.infer(&tensor)?;

    let (heatmap, overlay, method) = match self.explainer.explain(self.model, &tensor, prediction.target_index) {
      Ok(saliency) => match self.explainer.overlay(&image, &saliency, region) {
        Ok(overlay) => match crate::explain::overlay::encode_data_uri(&overlay) {
          Ok(uri) => (Some(uri), Some(overlay), Some(saliency.method())),
          Err(e) => {
            warn!("热力图编码失败: {}", e);
            (None, None, None)
          }
        },
        Err(e) => {
          warn!("热力图叠加失败: {}", e);
          (None, None, None)
        }
      },
      Err(SaliencyError::ModelError(e)) => return Err(e.into()),
      Err(e) => {
        warn!("无法生成热力图，结果中省略: {}", e);
        (None, None, None)
      }
    };

    let summary = CaseSummary::new(&prediction, patient.as_ref(), dicom_metadata.as_ref());
    let elapsed = started.elapsed();
    let result = DetectionResult {
      case_id: new_case_id(),
      timestamp: Utc::now(),
      filename: raw.filename().to_string(),
      heatmap,
      summary,
      processing_info: ProcessingInfo {
        image_format: format,
        model_version: self.model_version.clone(),
        has_dicom_metadata: dicom_metadata.is_some(),
        heatmap_method: method,
        heatmap_fallback: method == Some(SaliencyMethod::InputGradient),
        processing_time_ms: elapsed.as_secs_f64() * 1000.0,
      },
      dicom_metadata,
      patient_info: patient,
      overlay,
      prediction,
    };
    info!(
      "病例 {} 处理完成: {} ({:.2?})",
      result.case_id, result.prediction.predicted_class, elapsed
    );
    Ok(result)
  }
}

impl<'a, M> Model for DetectTask<'a, M>
where
  M: Model<Input = InputTensor, Output = Prediction, Error = ModelError> + Differentiable,
{
  type Input = RawImage;
  type Output = DetectionResult;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect(input, None)
  }
}

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入影像"))?;
    info!("输入影像获取成功，开始推理...");
    let now = Instant::now();
    let result = model.infer(&frame)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&frame, &result)?;
    info!("输出完成，总耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 对同一影像重复推理，统计平均耗时并检查预测类别是否稳定
pub struct RepeatShotTask {
  times: usize,
}

impl RepeatShotTask {
  pub fn new(times: usize) -> Self {
    Self { times: times.max(1) }
  }
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self::new(5)
  }
}

impl<
  F,
  D: WithLabel,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入影像"))?;
    info!("输入影像获取成功，开始推理...");
    let mut times = Vec::with_capacity(self.times);
    let mut first_label: Option<String> = None;
    for i in 0..self.times {
      let now = Instant::now();
      let result = model.infer(&frame)?;
      let elapsed = now.elapsed();
      debug!("({})推理完成，耗时: {:.2?}", i, elapsed);
      match &first_label {
        None => first_label = Some(result.label().to_string()),
        Some(label) if label != result.label() => {
          return Err(anyhow::anyhow!(
            "第 {} 次推理结果 {} 与首次结果 {} 不一致",
            i,
            result.label(),
            label
          ));
        }
        Some(_) => {}
      }
      output.render_result(&frame, &result)?;
      times.push(elapsed);
    }

    // 有足够样本时跳过前两次预热
    let skip = if times.len() > 2 { 2 } else { 0 };
    let counted = (times.len() - skip) as u32;
    warn!(
      "平均推理时间: {:.2?}（{} 次，预测类别稳定: {}）",
      times.iter().skip(skip).sum::<Duration>() / counted,
      times.len(),
      first_label.unwrap_or_default()
    );

    Ok(())
  }
}
