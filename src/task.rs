// 该文件是 Anfang （安防） 项目的一部分。
// src/task.rs - 推理任务
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

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::ConfidenceThreshold,
  frame::Frame,
  input::CameraError,
  model::{DetectResult, InferenceError, Model, infer_frame},
  output::Render,
  session::SessionState,
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("没有输入帧")]
  NoInput,
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error("渲染失败: {0}")]
  Render(Box<dyn std::error::Error + Send + Sync>),
}

/// 图片模式：一帧，一次推理，一次渲染
pub struct OneShotTask {
  threshold: ConfidenceThreshold,
}

impl OneShotTask {
  pub fn new(threshold: ConfidenceThreshold) -> Self {
    Self { threshold }
  }
}

impl<'m, I, O> Task<I, &'m dyn Model, O> for OneShotTask
where
  I: Iterator<Item = Frame>,
  O: Render,
{
  type Output = DetectResult;
  type Error = TaskError;

  fn run_task(self, mut input: I, model: &'m dyn Model, output: O) -> Result<DetectResult, TaskError> {
    info!("开始任务...");
    let frame = input.next().ok_or(TaskError::NoInput)?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = infer_frame(model, &frame, self.threshold)?;
    info!("推理完成，检测到 {} 个目标，耗时: {:.2?}", result.len(), now.elapsed());
    output
      .render_result(&frame, &result)
      .map_err(|e| TaskError::Render(Box::new(e)))?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(result)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 会话被停止
  Stopped,
  /// 摄像头不再产生帧
  StreamEnded,
  /// 达到指定帧数
  FrameLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
  pub frames: usize,
  pub reason: StopReason,
}

#[derive(Error, Debug)]
pub enum LoopError {
  #[error(transparent)]
  Camera(#[from] CameraError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error("渲染失败: {0}")]
  Render(Box<dyn std::error::Error + Send + Sync>),
}

/// 摄像头模式的采集循环
///
/// 每一帧依次采集、推理、渲染，然后检查会话状态。停止请求只在帧结束时生效，
/// 正在处理的帧总会被渲染。阈值每帧重新读取。
pub struct ContinuousTask<'s, T> {
  state: &'s SessionState,
  threshold: T,
  frame_number: Option<usize>,
}

impl<'s, T> ContinuousTask<'s, T>
where
  T: Fn() -> ConfidenceThreshold,
{
  pub fn new(state: &'s SessionState, threshold: T) -> Self {
    Self {
      state,
      threshold,
      frame_number: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<'s, 'm, T, I, O> Task<I, &'m dyn Model, O> for ContinuousTask<'s, T>
where
  T: Fn() -> ConfidenceThreshold,
  I: Iterator<Item = Result<Frame, CameraError>>,
  O: Render,
{
  type Output = LoopReport;
  type Error = LoopError;

  fn run_task(self, mut input: I, model: &'m dyn Model, output: O) -> Result<LoopReport, LoopError> {
    info!("开始采集循环...");
    let mut acquired = 0usize;
    let mut frames = 0usize;

    let reason = loop {
      let now = Instant::now();
      let frame = match input.next() {
        Some(Ok(frame)) => frame,
        Some(Err(e)) if acquired == 0 => return Err(e.into()),
        None if acquired == 0 => return Err(CameraError::NoFrame.into()),
        Some(Err(e)) => {
          warn!("采集失败，停止循环: {}", e);
          break StopReason::StreamEnded;
        }
        None => {
          info!("摄像头流结束");
          break StopReason::StreamEnded;
        }
      };
      acquired += 1;

      let threshold = (self.threshold)();
      let result = infer_frame(model, &frame, threshold)?;
      let elapsed_a = now.elapsed();
      output
        .render_result(&frame, &result)
        .map_err(|e| LoopError::Render(Box::new(e)))?;
      frames += 1;
      debug!(
        "第 {} 帧: {} 个目标, 阈值 {}, 耗时: {:.2?} / {:.2?}",
        frames,
        result.len(),
        threshold,
        elapsed_a,
        now.elapsed()
      );

      if self.frame_number.is_some_and(|n| frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frames);
        break StopReason::FrameLimit;
      }
      if !self.state.keep_running() {
        info!("会话已停止，退出任务循环");
        break StopReason::Stopped;
      }
    };

    drop(input);
    info!("采集循环结束，共 {} 帧", frames);
    Ok(LoopReport { frames, reason })
  }
}
