// 该文件是 Radox 项目的一部分。
// src/output.rs - 输出定义
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

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "directory_record"))]
use crate::FromUrlWithScheme;
use crate::input::RawImage;
use crate::task::DetectionResult;
use thiserror::Error;
use url::Url;

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

impl<Frame, Output, R: Render<Frame, Output>> Render<Frame, Output> for &R {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    (*self).render_result(frame, result)
  }
}

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("结果序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 将结果以 JSON 打印到标准输出
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutOutput {
  pretty: bool,
}

impl StdoutOutput {
  pub const SCHEME: &'static str = "stdout";

  pub fn pretty(mut self, pretty: bool) -> Self {
    self.pretty = pretty;
    self
  }
}

impl Render<RawImage, DetectionResult> for StdoutOutput {
  type Error = serde_json::Error;

  fn render_result(&self, _frame: &RawImage, result: &DetectionResult) -> Result<(), Self::Error> {
    let text = if self.pretty {
      serde_json::to_string_pretty(result)?
    } else {
      serde_json::to_string(result)?
    };
    println!("{}", text);
    Ok(())
  }
}

pub enum OutputWrapper {
  Stdout(StdoutOutput),
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      StdoutOutput::SCHEME => Ok(OutputWrapper::Stdout(
        StdoutOutput::default().pretty(url.query_pairs().any(|(k, _)| k == "pretty")),
      )),
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<RawImage, DetectionResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &RawImage, result: &DetectionResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Stdout(output) => output.render_result(frame, result).map_err(OutputError::from),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(OutputWrapper::from_url(&url), Err(OutputError::SchemeMismatch)));
  }

  #[test]
  fn stdout_scheme_parses_pretty_flag() {
    let url = Url::parse("stdout:///?pretty").unwrap();
    match OutputWrapper::from_url(&url).unwrap() {
      OutputWrapper::Stdout(output) => assert!(output.pretty),
      _ => panic!("应解析为标准输出"),
    }
  }
}
