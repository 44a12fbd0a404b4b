// 该文件是 Radox 项目的一部分。
// src/model/network.rs - 基于 ndarray 的卷积网络前向与反向传播
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

//! 推理所需的最小层集合。所有张量均为批大小 1 的 `[1, C, H, W]`，
//! 全连接层的输入输出以 `[1, N, 1, 1]` 表示。
//!
//! 反向传播只计算对输入的梯度（不需要参数梯度），复合层在反向时
//! 重新计算内部前向结果，因此前向阶段只需保存顶层的激活。

use ndarray::{Array1, Array2, Array3, Array4, Axis, concatenate, s};
use thiserror::Error;
use tracing::debug;

use crate::{
  explain::{Differentiable, LayerCapture, SaliencyError},
  frame::InputTensor,
};

#[derive(Error, Debug)]
pub enum NetworkError {
  #[error("张量形状不匹配: {0}")]
  ShapeMismatch(String),
  #[error("找不到网络层: {0}")]
  LayerNotFound(String),
  #[error("目标类别 {target} 超出输出范围 {classes}")]
  TargetOutOfRange { target: usize, classes: usize },
  #[error("前向轨迹无效: {0}")]
  InvalidTrace(String),
}

fn mismatch(detail: impl Into<String>) -> NetworkError {
  NetworkError::ShapeMismatch(detail.into())
}

fn dims(x: &Array4<f32>) -> [usize; 4] {
  let (n, c, h, w) = x.dim();
  [n, c, h, w]
}

/// 按逻辑顺序展平为二维矩阵，不依赖内存布局
fn to_matrix(x: &Array4<f32>, rows: usize, cols: usize) -> Result<Array2<f32>, NetworkError> {
  Array2::from_shape_vec((rows, cols), x.iter().copied().collect()).map_err(|e| mismatch(e.to_string()))
}

fn to_tensor(data: Vec<f32>, shape: [usize; 4]) -> Result<Array4<f32>, NetworkError> {
  Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), data)
    .map_err(|e| mismatch(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct Conv2d {
  weight: Array2<f32>,
  bias: Option<Array1<f32>>,
  in_channels: usize,
  kernel: (usize, usize),
  stride: usize,
  padding: usize,
}

impl Conv2d {
  /// `weight` 形状为 `[out, in, kh, kw]`
  pub fn new(
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
    stride: usize,
    padding: usize,
  ) -> Result<Self, NetworkError> {
    let (out, in_channels, kh, kw) = weight.dim();
    if stride == 0 || kh == 0 || kw == 0 {
      return Err(mismatch("卷积核或步长为零"));
    }
    if let Some(b) = &bias
      && b.len() != out
    {
      return Err(mismatch(format!("卷积偏置长度 {} 与输出通道 {} 不符", b.len(), out)));
    }
    let weight = to_matrix(&weight, out, in_channels * kh * kw)?;
    Ok(Self {
      weight,
      bias,
      in_channels,
      kernel: (kh, kw),
      stride,
      padding,
    })
  }

  pub fn out_channels(&self) -> usize {
    self.weight.nrows()
  }

  fn out_hw(&self, h: usize, w: usize) -> Result<(usize, usize), NetworkError> {
    let (kh, kw) = self.kernel;
    let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
    if ph < kh || pw < kw {
      return Err(mismatch(format!("输入 {}x{} 小于卷积核 {}x{}", h, w, kh, kw)));
    }
    Ok(((ph - kh) / self.stride + 1, (pw - kw) / self.stride + 1))
  }

  fn check_input(&self, x: &Array4<f32>) -> Result<(usize, usize, usize, usize), NetworkError> {
    let [_, c, h, w] = dims(x);
    if c != self.in_channels {
      return Err(mismatch(format!("卷积期望 {} 个输入通道，实际 {}", self.in_channels, c)));
    }
    let (oh, ow) = self.out_hw(h, w)?;
    Ok((h, w, oh, ow))
  }

  /// 展开卷积窗口，结果形状 `[C*kh*kw, oh*ow]`
  fn im2col(&self, x: &Array4<f32>, h: usize, w: usize, oh: usize, ow: usize) -> Result<Array2<f32>, NetworkError> {
    let (kh, kw) = self.kernel;
    let c = self.in_channels;
    let src: Vec<f32> = x.iter().copied().collect();
    let mut cols = vec![0.0_f32; c * kh * kw * oh * ow];
    for ci in 0..c {
      for ki in 0..kh {
        for kj in 0..kw {
          let row = ((ci * kh + ki) * kw + kj) * oh * ow;
          for oy in 0..oh {
            let Some(iy) = (oy * self.stride + ki).checked_sub(self.padding).filter(|v| *v < h) else {
              continue;
            };
            for ox in 0..ow {
              let Some(ix) = (ox * self.stride + kj).checked_sub(self.padding).filter(|v| *v < w) else {
                continue;
              };
              cols[row + oy * ow + ox] = src[(ci * h + iy) * w + ix];
            }
          }
        }
      }
    }
    Array2::from_shape_vec((c * kh * kw, oh * ow), cols).map_err(|e| mismatch(e.to_string()))
  }

  fn col2im(&self, cols: &Array2<f32>, h: usize, w: usize, oh: usize, ow: usize) -> Vec<f32> {
    let (kh, kw) = self.kernel;
    let c = self.in_channels;
    let mut out = vec![0.0_f32; c * h * w];
    for ci in 0..c {
      for ki in 0..kh {
        for kj in 0..kw {
          let row = cols.row((ci * kh + ki) * kw + kj);
          for oy in 0..oh {
            let Some(iy) = (oy * self.stride + ki).checked_sub(self.padding).filter(|v| *v < h) else {
              continue;
            };
            for ox in 0..ow {
              let Some(ix) = (ox * self.stride + kj).checked_sub(self.padding).filter(|v| *v < w) else {
                continue;
              };
              out[(ci * h + iy) * w + ix] += row[oy * ow + ox];
            }
          }
        }
      }
    }
    out
  }

  fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let (h, w, oh, ow) = self.check_input(x)?;
    let cols = self.im2col(x, h, w, oh, ow)?;
    let mut y = self.weight.dot(&cols);
    if let Some(bias) = &self.bias {
      for (mut row, b) in y.axis_iter_mut(Axis(0)).zip(bias.iter()) {
        row += *b;
      }
    }
    to_tensor(y.iter().copied().collect(), [1, self.out_channels(), oh, ow])
  }

  fn backward(&self, x: &Array4<f32>, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let (h, w, oh, ow) = self.check_input(x)?;
    let dy = to_matrix(dy, self.out_channels(), oh * ow)?;
    let dcols = self.weight.t().dot(&dy);
    to_tensor(self.col2im(&dcols, h, w, oh, ow), [1, self.in_channels, h, w])
  }

  fn num_parameters(&self) -> usize {
    self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
  }
}

/// 推理模式的批归一化，预先折叠为逐通道的仿射变换
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
  scale: Array1<f32>,
  shift: Array1<f32>,
}

impl BatchNorm2d {
  pub fn new(
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    eps: f32,
  ) -> Result<Self, NetworkError> {
    let c = gamma.len();
    if beta.len() != c || running_mean.len() != c || running_var.len() != c {
      return Err(mismatch("批归一化参数长度不一致"));
    }
    let scale = ndarray::Zip::from(&gamma)
      .and(&running_var)
      .map_collect(|g, v| g / (v + eps).sqrt());
    let shift = ndarray::Zip::from(&beta)
      .and(&running_mean)
      .and(&scale)
      .map_collect(|b, m, s| b - m * s);
    Ok(Self { scale, shift })
  }

  fn check(&self, x: &Array4<f32>) -> Result<(), NetworkError> {
    if x.dim().1 != self.scale.len() {
      return Err(mismatch(format!(
        "批归一化期望 {} 个通道，实际 {}",
        self.scale.len(),
        x.dim().1
      )));
    }
    Ok(())
  }

  fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    self.check(x)?;
    let mut y = x.to_owned();
    for (c, mut plane) in y.axis_iter_mut(Axis(1)).enumerate() {
      let (scale, shift) = (self.scale[c], self.shift[c]);
      plane.mapv_inplace(|v| v * scale + shift);
    }
    Ok(y)
  }

  fn backward(&self, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    self.check(dy)?;
    let mut dx = dy.to_owned();
    for (c, mut plane) in dx.axis_iter_mut(Axis(1)).enumerate() {
      let scale = self.scale[c];
      plane.mapv_inplace(|v| v * scale);
    }
    Ok(dx)
  }
}

#[derive(Debug, Clone, Copy)]
pub struct Pool2d {
  pub kernel: usize,
  pub stride: usize,
  pub padding: usize,
}

impl Pool2d {
  fn out_hw(&self, h: usize, w: usize) -> Result<(usize, usize), NetworkError> {
    let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
    if self.kernel == 0 || self.stride == 0 || ph < self.kernel || pw < self.kernel {
      return Err(mismatch(format!("池化窗口 {} 不适用于输入 {}x{}", self.kernel, h, w)));
    }
    Ok(((ph - self.kernel) / self.stride + 1, (pw - self.kernel) / self.stride + 1))
  }

  /// 输出位置 (oy, ox) 覆盖的有效输入坐标
  fn window(&self, oy: usize, ox: usize, h: usize, w: usize) -> impl Iterator<Item = (usize, usize)> {
    let (stride, padding, kernel) = (self.stride, self.padding, self.kernel);
    (0..kernel).flat_map(move |ki| {
      (0..kernel).filter_map(move |kj| {
        let iy = (oy * stride + ki).checked_sub(padding).filter(|v| *v < h)?;
        let ix = (ox * stride + kj).checked_sub(padding).filter(|v| *v < w)?;
        Some((iy, ix))
      })
    })
  }

  fn max_forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let [_, c, h, w] = dims(x);
    let (oh, ow) = self.out_hw(h, w)?;
    Ok(Array4::from_shape_fn((1, c, oh, ow), |(_, ci, oy, ox)| {
      self
        .window(oy, ox, h, w)
        .map(|(iy, ix)| x[[0, ci, iy, ix]])
        .fold(f32::NEG_INFINITY, f32::max)
    }))
  }

  fn max_backward(&self, x: &Array4<f32>, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let [_, c, h, w] = dims(x);
    let (oh, ow) = self.out_hw(h, w)?;
    if dims(dy) != [1, c, oh, ow] {
      return Err(mismatch("最大池化梯度形状不符"));
    }
    let mut dx = Array4::<f32>::zeros((1, c, h, w));
    for ci in 0..c {
      for oy in 0..oh {
        for ox in 0..ow {
          let mut best: Option<((usize, usize), f32)> = None;
          for (iy, ix) in self.window(oy, ox, h, w) {
            let v = x[[0, ci, iy, ix]];
            if best.is_none_or(|(_, b)| v > b) {
              best = Some(((iy, ix), v));
            }
          }
          if let Some(((iy, ix), _)) = best {
            dx[[0, ci, iy, ix]] += dy[[0, ci, oy, ox]];
          }
        }
      }
    }
    Ok(dx)
  }

  fn avg_forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let [_, c, h, w] = dims(x);
    let (oh, ow) = self.out_hw(h, w)?;
    let area = (self.kernel * self.kernel) as f32;
    Ok(Array4::from_shape_fn((1, c, oh, ow), |(_, ci, oy, ox)| {
      self.window(oy, ox, h, w).map(|(iy, ix)| x[[0, ci, iy, ix]]).sum::<f32>() / area
    }))
  }

  fn avg_backward(&self, x: &Array4<f32>, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let [_, c, h, w] = dims(x);
    let (oh, ow) = self.out_hw(h, w)?;
    if dims(dy) != [1, c, oh, ow] {
      return Err(mismatch("平均池化梯度形状不符"));
    }
    let area = (self.kernel * self.kernel) as f32;
    let mut dx = Array4::<f32>::zeros((1, c, h, w));
    for ci in 0..c {
      for oy in 0..oh {
        for ox in 0..ow {
          let g = dy[[0, ci, oy, ox]] / area;
          for (iy, ix) in self.window(oy, ox, h, w) {
            dx[[0, ci, iy, ix]] += g;
          }
        }
      }
    }
    Ok(dx)
  }
}

#[derive(Debug, Clone)]
pub struct Linear {
  weight: Array2<f32>,
  bias: Array1<f32>,
}

impl Linear {
  /// `weight` 形状为 `[out, in]`
  pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, NetworkError> {
    if weight.nrows() != bias.len() {
      return Err(mismatch(format!(
        "全连接偏置长度 {} 与输出维度 {} 不符",
        bias.len(),
        weight.nrows()
      )));
    }
    Ok(Self { weight, bias })
  }

  pub fn out_features(&self) -> usize {
    self.weight.nrows()
  }

  fn flatten(&self, x: &Array4<f32>) -> Result<Array1<f32>, NetworkError> {
    if x.len() != self.weight.ncols() {
      return Err(mismatch(format!(
        "全连接期望 {} 个输入，实际 {:?}",
        self.weight.ncols(),
        x.shape()
      )));
    }
    Ok(x.iter().copied().collect())
  }

  fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    let y = self.weight.dot(&self.flatten(x)?) + &self.bias;
    to_tensor(y.to_vec(), [1, self.out_features(), 1, 1])
  }

  fn backward(&self, x: &Array4<f32>, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    self.flatten(x)?;
    let dy: Array1<f32> = dy.iter().copied().collect();
    if dy.len() != self.out_features() {
      return Err(mismatch("全连接梯度长度不符"));
    }
    to_tensor(self.weight.t().dot(&dy).to_vec(), dims(x))
  }
}

/// 带名字的子层，名字与权重文件中的参数前缀对应
#[derive(Debug, Clone)]
pub struct Node {
  pub name: String,
  pub layer: Layer,
}

impl Node {
  pub fn new(name: impl Into<String>, layer: Layer) -> Self {
    Self {
      name: name.into(),
      layer,
    }
  }
}

#[derive(Debug, Clone)]
pub enum Layer {
  Conv2d(Conv2d),
  BatchNorm2d(BatchNorm2d),
  Relu,
  MaxPool2d(Pool2d),
  AvgPool2d(Pool2d),
  GlobalAvgPool,
  Linear(Linear),
  Sequential(Vec<Node>),
  /// 每个子层的输出沿通道拼接到其输入之后（DenseNet 稠密块）
  DenseConcat(Vec<Node>),
}

impl Layer {
  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    match self {
      Layer::Conv2d(conv) => conv.forward(x),
      Layer::BatchNorm2d(bn) => bn.forward(x),
      Layer::Relu => Ok(x.mapv(|v| v.max(0.0))),
      Layer::MaxPool2d(pool) => pool.max_forward(x),
      Layer::AvgPool2d(pool) => pool.avg_forward(x),
      Layer::GlobalAvgPool => {
        let [_, c, h, w] = dims(x);
        if h * w == 0 {
          return Err(mismatch("全局池化输入为空"));
        }
        let area = (h * w) as f32;
        let means = x.sum_axis(Axis(3)).sum_axis(Axis(2)).mapv(|v| v / area);
        to_tensor(means.iter().copied().collect(), [1, c, 1, 1])
      }
      Layer::Linear(linear) => linear.forward(x),
      Layer::Sequential(nodes) => {
        let mut x = x.to_owned();
        for node in nodes {
          x = node.layer.forward(&x)?;
        }
        Ok(x)
      }
      Layer::DenseConcat(nodes) => {
        let mut x = x.to_owned();
        for node in nodes {
          let y = node.layer.forward(&x)?;
          x = concatenate(Axis(1), &[x.view(), y.view()]).map_err(|e| mismatch(e.to_string()))?;
        }
        Ok(x)
      }
    }
  }

  /// 给定该层输入 `x` 与输出梯度 `dy`，返回输入梯度
  pub fn backward(&self, x: &Array4<f32>, dy: &Array4<f32>) -> Result<Array4<f32>, NetworkError> {
    match self {
      Layer::Conv2d(conv) => conv.backward(x, dy),
      Layer::BatchNorm2d(bn) => bn.backward(dy),
      Layer::Relu => {
        if x.dim() != dy.dim() {
          return Err(mismatch("ReLU 梯度形状不符"));
        }
        Ok(ndarray::Zip::from(x).and(dy).map_collect(|&x, &g| if x > 0.0 { g } else { 0.0 }))
      }
      Layer::MaxPool2d(pool) => pool.max_backward(x, dy),
      Layer::AvgPool2d(pool) => pool.avg_backward(x, dy),
      Layer::GlobalAvgPool => {
        let [_, c, h, w] = dims(x);
        if dy.len() != c {
          return Err(mismatch("全局池化梯度长度不符"));
        }
        let area = (h * w) as f32;
        let grads: Vec<f32> = dy.iter().map(|g| g / area).collect();
        Ok(Array4::from_shape_fn((1, c, h, w), |(_, ci, _, _)| grads[ci]))
      }
      Layer::Linear(linear) => linear.backward(x, dy),
      Layer::Sequential(nodes) => {
        let mut inputs = Vec::with_capacity(nodes.len());
        let mut cur = x.to_owned();
        for node in nodes {
          let next = node.layer.forward(&cur)?;
          inputs.push(cur);
          cur = next;
        }
        let mut grad = dy.to_owned();
        for (node, input) in nodes.iter().zip(inputs.iter()).rev() {
          grad = node.layer.backward(input, &grad)?;
        }
        Ok(grad)
      }
      Layer::DenseConcat(nodes) => {
        let mut inputs = Vec::with_capacity(nodes.len());
        let mut cur = x.to_owned();
        for node in nodes {
          let y = node.layer.forward(&cur)?;
          let next = concatenate(Axis(1), &[cur.view(), y.view()]).map_err(|e| mismatch(e.to_string()))?;
          inputs.push(cur);
          cur = next;
        }
        if dy.dim() != cur.dim() {
          return Err(mismatch("稠密块梯度形状不符"));
        }
        let mut grad = dy.to_owned();
        for (node, input) in nodes.iter().zip(inputs.iter()).rev() {
          let split = input.dim().1;
          let grad_y = grad.slice(s![.., split.., .., ..]).to_owned();
          let mut grad_x = grad.slice(s![.., ..split, .., ..]).to_owned();
          grad_x += &node.layer.backward(input, &grad_y)?;
          grad = grad_x;
        }
        Ok(grad)
      }
    }
  }

  /// 不做计算的形状推断
  pub fn output_shape(&self, shape: [usize; 4]) -> Result<[usize; 4], NetworkError> {
    let [n, c, h, w] = shape;
    match self {
      Layer::Conv2d(conv) => {
        if c != conv.in_channels {
          return Err(mismatch(format!("卷积期望 {} 个输入通道，实际 {}", conv.in_channels, c)));
        }
        let (oh, ow) = conv.out_hw(h, w)?;
        Ok([n, conv.out_channels(), oh, ow])
      }
      Layer::BatchNorm2d(_) | Layer::Relu => Ok(shape),
      Layer::MaxPool2d(pool) | Layer::AvgPool2d(pool) => {
        let (oh, ow) = pool.out_hw(h, w)?;
        Ok([n, c, oh, ow])
      }
      Layer::GlobalAvgPool => Ok([n, c, 1, 1]),
      Layer::Linear(linear) => Ok([n, linear.out_features(), 1, 1]),
      Layer::Sequential(nodes) => nodes.iter().try_fold(shape, |s, node| node.layer.output_shape(s)),
      Layer::DenseConcat(nodes) => nodes.iter().try_fold(shape, |s, node| {
        let out = node.layer.output_shape(s)?;
        if out[2] != s[2] || out[3] != s[3] {
          return Err(mismatch("稠密块子层改变了空间尺寸"));
        }
        Ok([s[0], s[1] + out[1], s[2], s[3]])
      }),
    }
  }

  pub fn contains_conv(&self) -> bool {
    match self {
      Layer::Conv2d(_) => true,
      Layer::Sequential(nodes) | Layer::DenseConcat(nodes) => {
        nodes.iter().any(|n| n.layer.contains_conv())
      }
      _ => false,
    }
  }

  /// 可训练参数数量（批归一化只计 γ 与 β）
  pub fn num_parameters(&self) -> usize {
    match self {
      Layer::Conv2d(conv) => conv.num_parameters(),
      Layer::BatchNorm2d(bn) => bn.scale.len() * 2,
      Layer::Linear(linear) => linear.weight.len() + linear.bias.len(),
      Layer::Sequential(nodes) | Layer::DenseConcat(nodes) => {
        nodes.iter().map(|n| n.layer.num_parameters()).sum()
      }
      _ => 0,
    }
  }
}

/// 从某一顶层开始记录的前向激活。
///
/// `activations[k]` 是第 `start + k` 个顶层的输入，最后一项为网络输出。
#[derive(Debug)]
pub struct Trace {
  start: usize,
  activations: Vec<Array4<f32>>,
}

impl Trace {
  pub fn start(&self) -> usize {
    self.start
  }

  /// 第 `index` 个顶层的输入
  pub fn input_of(&self, index: usize) -> Option<&Array4<f32>> {
    index.checked_sub(self.start).and_then(|k| self.activations.get(k))
  }

  pub fn output(&self) -> Option<&Array4<f32>> {
    self.activations.last()
  }
}

/// 特征提取部分 + 分类头，顶层按顺序排列
#[derive(Debug, Clone)]
pub struct Network {
  nodes: Vec<Node>,
  feature_count: usize,
  input_shape: [usize; 3],
}

impl Network {
  /// `input_shape` 为 `[C, H, W]`
  pub fn new(features: Vec<Node>, classifier: Vec<Node>, input_shape: [usize; 3]) -> Result<Self, NetworkError> {
    let feature_count = features.len();
    let mut nodes = features;
    nodes.extend(classifier);
    if nodes.is_empty() {
      return Err(NetworkError::InvalidTrace("网络没有任何层".to_string()));
    }
    let network = Self {
      nodes,
      feature_count,
      input_shape,
    };
    let out = network.nodes.iter().try_fold(network.full_input_shape(), |s, node| {
      node.layer.output_shape(s)
    })?;
    debug!("网络输出形状: {:?}", out);
    Ok(network)
  }

  fn full_input_shape(&self) -> [usize; 4] {
    let [c, h, w] = self.input_shape;
    [1, c, h, w]
  }

  pub fn input_shape(&self) -> [usize; 3] {
    self.input_shape
  }

  pub fn output_dim(&self) -> usize {
    self
      .nodes
      .iter()
      .try_fold(self.full_input_shape(), |s, node| node.layer.output_shape(s))
      .map(|[_, c, h, w]| c * h * w)
      .unwrap_or(0)
  }

  pub fn num_parameters(&self) -> usize {
    self.nodes.iter().map(|n| n.layer.num_parameters()).sum()
  }

  pub fn layer_names(&self) -> impl Iterator<Item = &str> {
    self.nodes.iter().map(|n| n.name.as_str())
  }

  pub fn layer_index(&self, name: &str) -> Option<usize> {
    self.nodes.iter().position(|n| n.name == name)
  }

  pub fn layer_name(&self, index: usize) -> Option<&str> {
    self.nodes.get(index).map(|n| n.name.as_str())
  }

  /// Grad-CAM 目标层：最深的、含卷积且输出仍有空间范围的特征层；
  /// 找不到时退回最后一个特征层
  pub fn gradcam_layer_index(&self) -> Option<usize> {
    let mut shape = self.full_input_shape();
    let mut chosen = None;
    for (i, node) in self.nodes[..self.feature_count].iter().enumerate() {
      shape = node.layer.output_shape(shape).ok()?;
      if node.layer.contains_conv() && (shape[2] > 1 || shape[3] > 1) {
        chosen = Some(i);
      }
    }
    chosen.or_else(|| self.feature_count.checked_sub(1))
  }

  pub fn forward(&self, input: &InputTensor) -> Result<Array1<f32>, NetworkError> {
    let mut x = input.as_array().to_owned();
    for node in &self.nodes {
      x = node.layer.forward(&x)?;
    }
    Ok(x.iter().copied().collect())
  }

  /// 前 `start` 层不做记录，其后每个顶层的输入都被保存
  pub fn trace_from(&self, input: &InputTensor, start: usize) -> Result<Trace, NetworkError> {
    if start > self.nodes.len() {
      return Err(NetworkError::InvalidTrace(format!("起始层 {} 超出范围", start)));
    }
    let mut x = input.as_array().to_owned();
    for node in &self.nodes[..start] {
      x = node.layer.forward(&x)?;
    }
    let mut activations = Vec::with_capacity(self.nodes.len() - start + 1);
    for node in &self.nodes[start..] {
      let next = node.layer.forward(&x)?;
      activations.push(x);
      x = next;
    }
    activations.push(x);
    Ok(Trace { start, activations })
  }

  /// 从网络输出梯度 `seed` 反向传播到第 `down_to` 个顶层的输入
  pub fn backward(&self, trace: &Trace, seed: Array4<f32>, down_to: usize) -> Result<Array4<f32>, NetworkError> {
    if down_to < trace.start || trace.activations.len() != self.nodes.len() - trace.start + 1 {
      return Err(NetworkError::InvalidTrace(format!(
        "无法从起始层 {} 的轨迹反向到第 {} 层",
        trace.start, down_to
      )));
    }
    let mut grad = seed;
    for index in (down_to..self.nodes.len()).rev() {
      let input = &trace.activations[index - trace.start];
      grad = self.nodes[index].layer.backward(input, &grad)?;
    }
    Ok(grad)
  }

  fn one_hot(&self, logits: &Array4<f32>, target: usize) -> Result<(Array4<f32>, f32), NetworkError> {
    let classes = logits.len();
    let score = logits
      .iter()
      .nth(target)
      .copied()
      .ok_or(NetworkError::TargetOutOfRange { target, classes })?;
    let mut seed = Array4::<f32>::zeros(logits.dim());
    if let Some(slot) = seed.iter_mut().nth(target) {
      *slot = 1.0;
    }
    Ok((seed, score))
  }

  /// 第 `layer` 层输出的激活、目标 logit 对它的梯度以及该 logit
  pub fn capture(
    &self,
    input: &InputTensor,
    layer: usize,
    target: usize,
  ) -> Result<(Array3<f32>, Array3<f32>, f32), NetworkError> {
    if layer >= self.nodes.len() {
      return Err(NetworkError::LayerNotFound(format!("#{}", layer)));
    }
    let trace = self.trace_from(input, layer + 1)?;
    let logits = trace.output().ok_or_else(|| NetworkError::InvalidTrace("空轨迹".to_string()))?;
    let (seed, score) = self.one_hot(logits, target)?;
    let grads = self.backward(&trace, seed, layer + 1)?;
    let activations = trace
      .input_of(layer + 1)
      .ok_or_else(|| NetworkError::InvalidTrace("缺少目标层激活".to_string()))?;
    Ok((
      activations.index_axis(Axis(0), 0).to_owned(),
      grads.index_axis(Axis(0), 0).to_owned(),
      score,
    ))
  }

  /// 目标 logit 对网络输入的梯度，形状 `[1, C, H, W]`
  pub fn input_gradient(&self, input: &InputTensor, target: usize) -> Result<Array4<f32>, NetworkError> {
    let trace = self.trace_from(input, 0)?;
    let logits = trace.output().ok_or_else(|| NetworkError::InvalidTrace("空轨迹".to_string()))?;
    let (seed, _) = self.one_hot(logits, target)?;
    self.backward(&trace, seed, 0)
  }
}

impl Differentiable for Network {
  fn gradcam_layer(&self) -> Option<String> {
    self
      .gradcam_layer_index()
      .and_then(|i| self.layer_name(i))
      .map(str::to_string)
  }

  fn capture_layer(&self, input: &InputTensor, layer: &str, target: usize) -> Result<LayerCapture, SaliencyError> {
    let index = self
      .layer_index(layer)
      .ok_or_else(|| NetworkError::LayerNotFound(layer.to_string()))?;
    let (activations, gradients, score) = self.capture(input, index, target)?;
    Ok(LayerCapture {
      activations,
      gradients,
      score,
    })
  }

  fn input_gradient(&self, input: &InputTensor, target: usize) -> Result<Array4<f32>, SaliencyError> {
    Ok(Network::input_gradient(self, input, target)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array, array};

  fn tensor(data: Array4<f32>) -> InputTensor {
    InputTensor::try_from(data).unwrap()
  }

  fn ramp(shape: (usize, usize, usize, usize), seed: f32) -> Array4<f32> {
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    Array::from_iter((0..n).map(|i| ((i as f32 * 0.37 + seed).sin())))
      .into_shape_with_order(shape)
      .unwrap()
  }

  fn small_network() -> Network {
    let conv = Conv2d::new(ramp((3, 1, 3, 3), 0.1), Some(array![0.1, -0.2, 0.05]), 1, 1).unwrap();
    let bn = BatchNorm2d::new(
      array![1.0, 0.5, 2.0],
      array![0.0, 0.1, -0.1],
      array![0.1, 0.0, 0.2],
      array![1.0, 2.0, 0.5],
      1e-5,
    )
    .unwrap();
    let dense_conv = Conv2d::new(ramp((2, 3, 1, 1), 0.7), None, 1, 0).unwrap();
    let features = vec![
      Node::new("conv0", Layer::Conv2d(conv)),
      Node::new("norm0", Layer::BatchNorm2d(bn)),
      Node::new(
        "pool0",
        Layer::MaxPool2d(Pool2d {
          kernel: 3,
          stride: 2,
          padding: 1,
        }),
      ),
      Node::new(
        "block",
        Layer::DenseConcat(vec![Node::new(
          "layer1",
          Layer::Sequential(vec![
            Node::new("relu", Layer::Relu),
            Node::new("conv", Layer::Conv2d(dense_conv)),
          ]),
        )]),
      ),
      Node::new(
        "pool1",
        Layer::AvgPool2d(Pool2d {
          kernel: 2,
          stride: 2,
          padding: 0,
        }),
      ),
    ];
    let linear = Linear::new(ramp((1, 1, 2, 5), 1.3).into_shape_with_order((2, 5)).unwrap(), array![0.0, 0.3]).unwrap();
    let classifier = vec![
      Node::new("relu", Layer::Relu),
      Node::new("pool", Layer::GlobalAvgPool),
      Node::new("classifier", Layer::Linear(linear)),
    ];
    Network::new(features, classifier, [1, 8, 8]).unwrap()
  }

  #[test]
  fn conv_matches_direct_sum() {
    let weight = array![[[[1.0, 0.0], [0.0, -1.0]]]];
    let conv = Conv2d::new(weight, Some(array![0.5]), 1, 0).unwrap();
    let x = array![[[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]]];
    let y = conv.forward(&x).unwrap();
    assert_eq!(y, array![[[[1.0 - 5.0 + 0.5, 2.0 - 6.0 + 0.5], [4.0 - 8.0 + 0.5, 5.0 - 9.0 + 0.5]]]]);
  }

  #[test]
  fn shapes_follow_layers() {
    let net = small_network();
    assert_eq!(net.output_dim(), 2);
    let logits = net.forward(&tensor(ramp((1, 1, 8, 8), 0.0))).unwrap();
    assert_eq!(logits.len(), 2);
    assert_eq!(net.gradcam_layer_index(), Some(3));
    assert_eq!(net.layer_name(3), Some("block"));
  }

  #[test]
  fn forward_is_deterministic() {
    let net = small_network();
    let input = tensor(ramp((1, 1, 8, 8), 0.4));
    assert_eq!(net.forward(&input).unwrap(), net.forward(&input).unwrap());
  }

  #[test]
  fn input_gradient_matches_finite_differences() {
    let net = small_network();
    let base = ramp((1, 1, 8, 8), 0.9);
    let grad = net.input_gradient(&tensor(base.clone()), 1).unwrap();
    let h = 1e-3_f32;
    for idx in [(0, 0, 0, 0), (0, 0, 3, 4), (0, 0, 7, 2)] {
      let mut plus = base.clone();
      plus[idx] += h;
      let mut minus = base.clone();
      minus[idx] -= h;
      let fd = (net.forward(&tensor(plus)).unwrap()[1] - net.forward(&tensor(minus)).unwrap()[1]) / (2.0 * h);
      assert!((fd - grad[idx]).abs() < 1e-2, "fd={} analytic={}", fd, grad[idx]);
    }
  }

  #[test]
  fn capture_returns_layer_map() {
    let net = small_network();
    let (acts, grads, score) = net.capture(&tensor(ramp((1, 1, 8, 8), 0.2)), 3, 0).unwrap();
    assert_eq!(acts.dim(), (5, 4, 4));
    assert_eq!(grads.dim(), acts.dim());
    assert!(score.is_finite());
  }

  #[test]
  fn target_out_of_range_is_error() {
    let net = small_network();
    assert!(matches!(
      net.input_gradient(&tensor(ramp((1, 1, 8, 8), 0.2)), 5),
      Err(NetworkError::TargetOutOfRange { target: 5, classes: 2 })
    ));
  }

  #[test]
  fn parameter_count_sums_layers() {
    let net = small_network();
    // conv0 27+3, norm0 6, dense conv 6, linear 10+2
    assert_eq!(net.num_parameters(), 54);
  }
}
