// 该文件是 Radox 项目的一部分。
// src/input/image_file.rs - 本地影像文件输入
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

use tracing::{error, info};
use url::Url;

use super::{InputError, RawImage};
use crate::{FromUrl, FromUrlWithScheme};

const READ_IMAGE_FILE_SCHEME: &str = "image";

/// 从 `image:///path/to/chest.dcm` 读取一份原始影像
pub struct ImageFileInput {
  raw: Option<RawImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}'，实际 '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch);
    }

    let path = Path::new(url.path());
    let bytes = std::fs::read(path)?;
    let filename = path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();
    info!("读取影像文件: {} ({} 字节)", path.display(), bytes.len());

    Ok(ImageFileInput {
      raw: Some(RawImage::new(bytes, filename)),
    })
  }
}

impl ImageFileInput {
  pub fn into_raw(self) -> Option<RawImage> {
    self.raw
  }
}

impl Iterator for ImageFileInput {
  type Item = RawImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.raw.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn reads_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chest.png");
    std::fs::File::create(&path).unwrap().write_all(&[1, 2, 3]).unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file", "image", 1)).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let raw = input.next().unwrap();
    assert_eq!(raw.filename(), "chest.png");
    assert_eq!(raw.bytes(), &[1, 2, 3]);
    assert!(input.next().is_none());
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("file:///tmp/chest.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
