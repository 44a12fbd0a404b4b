// 该文件是 Radox 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use chrono::Datelike;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::{FromUrl, FromUrlWithScheme, input::RawImage, output::Render, task::DetectionResult};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 按日期归档病例：`<root>/YYYY/MM/DD/<case_id>.json` 与同名 `.png` 叠加图。
///
/// `folder:///records?positive` 只记录判定为肺炎的病例。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  positive_only: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let positive_only = uri.query_pairs().any(|(k, _)| k == "positive");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      positive_only,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn case_directory(&self, result: &DetectionResult) -> Result<PathBuf, DirectoryRecordOutputError> {
    let stamp = result.timestamp;
    let directory = self
      .directory
      .join(stamp.year().to_string())
      .join(format!("{:02}", stamp.month()))
      .join(format!("{:02}", stamp.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }
    Ok(directory)
  }
}

impl Render<RawImage, DetectionResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RawImage, result: &DetectionResult) -> Result<(), Self::Error> {
    if self.positive_only && !result.prediction.has_pneumonia {
      debug!("{} 判定为 {}，跳过记录", frame.filename(), result.prediction.predicted_class);
      return Ok(());
    }

    let directory = self.case_directory(result)?;
    let json_path = directory.join(format!("{}.json", result.case_id));
    std::fs::write(&json_path, serde_json::to_vec_pretty(result)?)?;
    if let Some(overlay) = &result.overlay {
      overlay.save(directory.join(format!("{}.png", result.case_id)))?;
    }
    info!("病例记录已写入: {}", json_path.display());

    Ok(())
  }
}
