// 该文件是 Radox 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Radox 胸部 X 光肺炎推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型权重，例如 densenet:///models/densenet121-res224-all.safetensors
  /// （未指定时使用配置文件中的 model_url）
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,

  /// 输入影像，例如 image:///data/chest.dcm
  /// 支持格式: *.jpg, *.jpeg, *.png, *.dcm, *.dicom
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出位置
  /// - stdout:///?pretty  打印 JSON
  /// - image:///out/heatmap.png  保存热力图叠加图
  /// - folder:///records  按日期归档 JSON 与叠加图
  #[arg(long, default_value = "stdout:///?pretty", value_name = "OUTPUT")]
  pub output: Url,

  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 输入梯度平滑的高斯核标准差，0 表示不平滑
  #[arg(long, value_name = "SIGMA")]
  pub blur_sigma: Option<f32>,

  /// 指定 Grad-CAM 目标层
  #[arg(long, value_name = "LAYER")]
  pub target_layer: Option<String>,

  /// 患者年龄
  #[arg(long)]
  pub age: Option<u32>,

  /// 患者性别
  #[arg(long)]
  pub gender: Option<String>,

  /// 症状描述
  #[arg(long)]
  pub symptoms: Option<String>,

  /// 既往病史
  #[arg(long)]
  pub clinical_history: Option<String>,

  /// 仅打印模型信息后退出
  #[arg(long)]
  pub model_info: bool,
}
