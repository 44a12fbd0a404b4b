// 该文件是 Radox 项目的一部分。
// tests/pipeline.rs - 端到端流程测试
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

use std::{collections::HashMap, io::Cursor};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use ndarray::{ArrayD, IxDyn};
use tempfile::{NamedTempFile, TempDir};

use radox::{
  FromUrl,
  config::DetectorConfig,
  explain::DATA_URI_PREFIX,
  input::{Channels, ImageFormat, InputError, RawImage, ingest},
  model::{Classifier, DenseNetConfig, MODEL_CONFIG_KEY, OutputActivation, SafeTensorWeights},
  output::{OutputWrapper, Render},
  preprocess::PreprocessConfig,
  task::{DetectError, DetectTask, OneShotTask, PatientInfo, Task},
};

fn tiny_config() -> DenseNetConfig {
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

fn weights_file(config: &DenseNetConfig) -> NamedTempFile {
  let tensors = config.parameter_shapes().into_iter().enumerate().map(|(k, (name, shape))| {
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
    (name, ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap())
  });
  let metadata = HashMap::from([(MODEL_CONFIG_KEY.to_string(), serde_json::to_string(config).unwrap())]);
  let bytes = SafeTensorWeights::serialize(tensors, Some(metadata)).unwrap();
  let file = NamedTempFile::new().unwrap();
  std::fs::write(file.path(), bytes).unwrap();
  file
}

fn loaded_classifier(weights: &NamedTempFile) -> Classifier {
  let mut classifier = Classifier::builder()
    .weights_path(weights.path())
    .config(tiny_config())
    .build();
  classifier.load().unwrap();
  classifier
}

fn detector_config() -> DetectorConfig {
  DetectorConfig::default().with_preprocess(PreprocessConfig {
    width: 32,
    height: 32,
    ..Default::default()
  })
}

fn gray_png(width: u32, height: u32, value: u8) -> Vec<u8> {
  let img = image::GrayImage::from_pixel(width, height, image::Luma([value]));
  let mut bytes = Vec::new();
  image::DynamicImage::ImageLuma8(img)
    .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
    .unwrap();
  bytes
}

fn windowed_dicom(rows: u16, cols: u16) -> Vec<u8> {
  let n = rows as usize * cols as usize;
  let pixels: Vec<u16> = (0..n).map(|i| (i * 4095 / (n - 1)) as u16).collect();
  let elements = vec![
    DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("CASE-B")),
    DataElement::new(tags::PATIENT_SEX, VR::CS, PrimitiveValue::from("F")),
    DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("DX")),
    DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
    DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
    DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
    DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(cols)),
    DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
    DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(12_u16)),
    DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(11_u16)),
    DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
    DataElement::new(tags::WINDOW_CENTER, VR::DS, PrimitiveValue::from("128")),
    DataElement::new(tags::WINDOW_WIDTH, VR::DS, PrimitiveValue::from("256")),
    DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())),
  ];
  let file = InMemDicomObject::from_element_iter(elements)
    .with_meta(
      FileMetaTableBuilder::new()
        .transfer_syntax("1.2.840.10008.1.2.1")
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.1.1")
        .media_storage_sop_instance_uid("2.25.42"),
    )
    .unwrap();
  let mut bytes = Vec::new();
  file.write_all(&mut bytes).unwrap();
  bytes
}

#[test]
fn uniform_gray_png_is_deterministic_over_five_runs() {
  let weights = weights_file(&tiny_config());
  let classifier = loaded_classifier(&weights);
  let config = detector_config();
  let task = DetectTask::from_config(&classifier, &config);
  let raw = RawImage::new(gray_png(512, 512, 128), "uniform.png");

  let results: Vec<_> = (0..5).map(|_| task.detect(&raw, None).unwrap()).collect();
  let first = &results[0];
  for result in &results[1..] {
    assert_eq!(result.prediction.raw_predictions, first.prediction.raw_predictions);
    assert_eq!(result.prediction.predicted_class, first.prediction.predicted_class);
    assert_eq!(result.prediction.confidence, first.prediction.confidence);
    assert_eq!(result.heatmap, first.heatmap);
  }

  let probabilities = &first.prediction.class_probabilities;
  assert_eq!(probabilities.len(), 2);
  assert!(probabilities.values().all(|p| (0.0..=1.0).contains(p)));
  assert!((probabilities.values().sum::<f64>() - 1.0).abs() < 1e-9);
  assert!((0.5..=1.0).contains(&first.prediction.confidence));
  assert_eq!(first.processing_info.model_version, "densenet-tiny");
  let heatmap = first.heatmap.as_ref().expect("均匀灰度图也应得到热力图");
  assert!(heatmap.starts_with(DATA_URI_PREFIX));
  assert!(heatmap.len() > DATA_URI_PREFIX.len());
  assert_eq!(first.overlay.as_ref().map(|o| o.dimensions()), Some((512, 512)));
}

#[test]
fn windowed_dicom_spans_full_range_and_carries_metadata() {
  let bytes = windowed_dicom(64, 64);
  let raw = RawImage::new(bytes, "study.dcm");

  let image = ingest(&raw, Channels::Gray).unwrap();
  assert_eq!(image.format(), ImageFormat::Dicom);
  assert_eq!(image.shape(), &[64, 64]);
  assert_eq!(image.min_max(), (0.0, 255.0));

  let weights = weights_file(&tiny_config());
  let classifier = loaded_classifier(&weights);
  let config = detector_config();
  let patient = PatientInfo {
    age: Some(67),
    symptoms: Some("disnea".to_string()),
    ..Default::default()
  };
  let result = DetectTask::from_config(&classifier, &config)
    .detect(&raw, Some(patient))
    .unwrap();

  assert!(result.processing_info.has_dicom_metadata);
  assert_eq!(result.processing_info.image_format, ImageFormat::Dicom);
  let metadata = result.dicom_metadata.as_ref().unwrap();
  assert_eq!(metadata.patient_id.as_deref(), Some("CASE-B"));
  assert_eq!(result.summary.patient_sex.as_deref(), Some("F"));
  assert_eq!(result.summary.modality.as_deref(), Some("DX"));
  assert_eq!(result.summary.age, Some(67));
}

#[test]
fn truncated_png_is_decode_error() {
  let weights = weights_file(&tiny_config());
  let classifier = loaded_classifier(&weights);
  let config = detector_config();
  let mut bytes = gray_png(128, 128, 90);
  bytes.truncate(bytes.len() / 3);

  let err = DetectTask::from_config(&classifier, &config)
    .detect(&RawImage::new(bytes, "broken.png"), None)
    .unwrap_err();
  assert!(matches!(err, DetectError::InputError(InputError::ImageDecodeError(_))));
  assert!(err.is_client_error());
}

#[test]
fn embedded_architecture_rescues_mismatched_config() {
  let weights = weights_file(&tiny_config());
  let mut classifier = Classifier::builder().weights_path(weights.path()).build();
  classifier.load().unwrap();
  assert_eq!(classifier.config().name, "densenet-tiny");
  assert_eq!(classifier.model_info().input_shape, [1, 1, 32, 32]);
}

#[test]
fn embedded_architecture_drives_preprocessing_size() {
  let weights = weights_file(&tiny_config());
  let mut classifier = Classifier::builder().weights_path(weights.path()).build();
  classifier.load().unwrap();
  assert_eq!(classifier.network().map(|n| n.input_shape()), Some([1, 32, 32]));

  let raw = RawImage::new(gray_png(300, 300, 110), "fallback.png");
  let result = DetectTask::from_config(&classifier, &DetectorConfig::default())
    .detect(&raw, None)
    .unwrap();
  let sum: f64 = result.prediction.class_probabilities.values().sum();
  assert!((sum - 1.0).abs() < 1e-9);
  assert_eq!(result.overlay.as_ref().map(|o| o.dimensions()), Some((300, 300)));
}

#[test]
fn directory_record_writes_dated_case_files() {
  let weights = weights_file(&tiny_config());
  let classifier = loaded_classifier(&weights);
  let config = detector_config();
  let records = TempDir::new().unwrap();
  let url = url::Url::parse(&format!("folder://{}", records.path().display())).unwrap();
  let output = OutputWrapper::from_url(&url).unwrap();

  let png = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
  std::fs::write(png.path(), gray_png(96, 64, 70)).unwrap();
  let input_url = url::Url::parse(&format!("image://{}", png.path().display())).unwrap();
  let input = radox::input::ImageFileInput::from_url(&input_url).unwrap();

  let task = DetectTask::from_config(&classifier, &config);
  let raw = RawImage::new(gray_png(96, 64, 70), "record.png");
  let result = task.detect(&raw, None).unwrap();
  output.render_result(&raw, &result).unwrap();

  let day = records
    .path()
    .join(result.timestamp.format("%Y").to_string())
    .join(result.timestamp.format("%m").to_string())
    .join(result.timestamp.format("%d").to_string());
  let json = std::fs::read_to_string(day.join(format!("{}.json", result.case_id))).unwrap();
  let value: serde_json::Value = serde_json::from_str(&json).unwrap();
  assert_eq!(value["case_id"], result.case_id.as_str());
  let overlay = result.overlay.as_ref().expect("uniform gray input should still yield a heatmap");
  let saved = image::open(day.join(format!("{}.png", result.case_id))).unwrap();
  assert_eq!((saved.width(), saved.height()), overlay.dimensions());
  assert_eq!((saved.width(), saved.height()), (96, 64));

  OneShotTask.run_task(input, task, output).unwrap();
}

#[test]
fn image_sink_saves_overlay_png() {
  let weights = weights_file(&tiny_config());
  let classifier = loaded_classifier(&weights);
  let config = detector_config();
  let out = TempDir::new().unwrap();
  let target = out.path().join("nested").join("heatmap.png");
  let url = url::Url::parse(&format!("image://{}", target.display())).unwrap();
  let output = OutputWrapper::from_url(&url).unwrap();

  let raw = RawImage::new(gray_png(80, 60, 150), "sink.png");
  let result = DetectTask::from_config(&classifier, &config).detect(&raw, None).unwrap();
  output.render_result(&raw, &result).unwrap();

  assert!(result.heatmap.is_some());
  assert!(result.overlay.is_some());
  let saved = image::open(&target).unwrap();
  assert_eq!((saved.width(), saved.height()), (80, 60));
}
