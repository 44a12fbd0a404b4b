// 该文件是 Radox 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理基准
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

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use radox::{
  FromUrl,
  config::DetectorConfig,
  task::{DetectTask, RepeatShotTask, Task},
};
use tracing::info;

/// Radox 重复推理基准
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型权重路径
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, default_value = "stdout:///", value_name = "OUTPUT")]
  pub output: Url,
  /// 重复次数
  #[arg(long, default_value = "20", value_name = "TIMES")]
  pub times: usize,
  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("重复次数: {}", args.times);

  let config = match &args.config {
    Some(path) => DetectorConfig::from_json_file(path).with_context(|| format!("无法读取配置文件 {}", path.display()))?,
    None => DetectorConfig::default(),
  };

  let input_image = radox::input::ImageFileInput::from_url(&args.input)?;
  let mut classifier = radox::model::ClassifierBuilder::from_url(&args.model)?.build();
  classifier.load().context("模型加载失败")?;
  let output = radox::output::OutputWrapper::from_url(&args.output)?;

  let task = DetectTask::from_config(&classifier, &config);
  RepeatShotTask::new(args.times).run_task(input_image, task, output)?;

  Ok(())
}
