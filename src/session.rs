// 该文件是 Anfang （安防） 项目的一部分。
// src/session.rs - 会话运行状态
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

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
  #[default]
  Stopped,
  Running,
}

/// `start` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
  /// 已经在运行，什么也不做
  AlreadyRunning,
  /// 上一个循环还没退出，它会继续运行
  Resumed,
  /// 调用方需要启动一个新的采集循环
  SpawnLoop,
}

#[derive(Debug, Default)]
struct Inner {
  mode: SessionMode,
  loop_attached: bool,
}

/// 会话的启停状态机。采集循环是否继续只由这里决定
#[derive(Debug, Default)]
pub struct SessionState {
  inner: Mutex<Inner>,
}

impl SessionState {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn start(&self) -> Started {
    let mut inner = self.lock();
    if inner.mode == SessionMode::Running {
      return Started::AlreadyRunning;
    }

    inner.mode = SessionMode::Running;
    if inner.loop_attached {
      debug!("上一个采集循环仍在运行，继续使用");
      Started::Resumed
    } else {
      inner.loop_attached = true;
      Started::SpawnLoop
    }
  }

  /// 返回状态是否发生了变化
  pub fn stop(&self) -> bool {
    let mut inner = self.lock();
    let changed = inner.mode == SessionMode::Running;
    inner.mode = SessionMode::Stopped;
    changed
  }

  pub fn mode(&self) -> SessionMode {
    self.lock().mode
  }

  pub fn is_running(&self) -> bool {
    self.mode() == SessionMode::Running
  }

  pub fn has_loop(&self) -> bool {
    self.lock().loop_attached
  }

  /// 每帧结束时的检查。返回 false 时循环必须退出，并且已经解除挂载
  pub fn keep_running(&self) -> bool {
    let mut inner = self.lock();
    if inner.mode == SessionMode::Running {
      true
    } else {
      inner.loop_attached = false;
      false
    }
  }

  /// 循环因任何原因退出时调用
  pub fn release_loop(&self) {
    let mut inner = self.lock();
    inner.mode = SessionMode::Stopped;
    inner.loop_attached = false;
  }

  /// 会话结束
  pub fn reset(&self) {
    self.lock().mode = SessionMode::Stopped;
  }
}
