// 该文件是 Radox 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use radox::{
  FromUrl,
  config::DetectorConfig,
  input::ImageFileInput,
  model::ClassifierBuilder,
  output::{OutputWrapper, Render},
  task::{DetectTask, PatientInfo},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  let mut config = match &args.config {
    Some(path) => DetectorConfig::from_json_file(path).with_context(|| format!("无法读取配置文件 {}", path.display()))?,
    None => DetectorConfig::default(),
  };
  if let Some(model) = args.model.clone() {
    config = config.with_model_url(model);
  }
  if let Some(sigma) = args.blur_sigma {
    config = config.with_blur_sigma(sigma);
  }
  if args.target_layer.is_some() {
    config = config.with_target_layer(args.target_layer.clone());
  }

  let model_url = config.model_url.clone().context("未指定模型权重 (--model 或配置文件 model_url)")?;
  info!("模型文件路径: {}", model_url);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut classifier = ClassifierBuilder::from_url(&model_url)?.build();
  classifier.load().context("模型加载失败")?;

  if args.model_info {
    println!("{}", serde_json::to_string_pretty(&classifier.model_info())?);
    return Ok(());
  }

  let raw = ImageFileInput::from_url(&args.input)?
    .into_raw()
    .context("没有输入影像")?;
  let output = OutputWrapper::from_url(&args.output)?;

  let patient = PatientInfo {
    age: args.age,
    gender: args.gender,
    symptoms: args.symptoms,
    clinical_history: args.clinical_history,
  };
  let patient = (patient != PatientInfo::default()).then_some(patient);

  let task = DetectTask::from_config(&classifier, &config);
  let result = task.detect(&raw, patient)?;
  info!(
    "诊断: {} / {}",
    result.summary.diagnosis, result.prediction.recommendation
  );
  output.render_result(&raw, &result)?;

  Ok(())
}
