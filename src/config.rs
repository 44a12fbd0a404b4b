// 该文件是 Radox 项目的一部分。
// src/config.rs - 推理配置
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{explain::ExplainConfig, preprocess::PreprocessConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
}

/// 一次推理所需的全部可调参数，命令行参数在其之上覆盖
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
  /// `densenet:///path/to/weights.safetensors`
  pub model_url: Option<Url>,
  pub preprocess: PreprocessConfig,
  pub explain: ExplainConfig,
}

impl DetectorConfig {
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }

  pub fn with_model_url(mut self, url: Url) -> Self {
    self.model_url = Some(url);
    self
  }

  pub fn with_preprocess(mut self, preprocess: PreprocessConfig) -> Self {
    self.preprocess = preprocess;
    self
  }

  pub fn with_explain(mut self, explain: ExplainConfig) -> Self {
    self.explain = explain;
    self
  }

  pub fn with_blur_sigma(mut self, sigma: f32) -> Self {
    self.explain.blur_sigma = sigma;
    self
  }

  pub fn with_target_layer(mut self, layer: Option<String>) -> Self {
    self.explain.target_layer = layer;
    self
  }
}
