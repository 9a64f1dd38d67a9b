// 该文件是 Anfang （安防） 项目的一部分。
// src/server/sessions.rs - 浏览器会话
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

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
  config::ConfidenceThreshold,
  output::{DisplaySlot, draw::Draw},
  session::SessionState,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
  Info,
  Error,
}

/// 页面提示栏的内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
  pub level: NoticeLevel,
  pub message: String,
  pub at: DateTime<Utc>,
}

impl Notice {
  pub fn info(message: impl Into<String>) -> Self {
    Self {
      level: NoticeLevel::Info,
      message: message.into(),
      at: Utc::now(),
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self {
      level: NoticeLevel::Error,
      message: message.into(),
      at: Utc::now(),
    }
  }
}

#[derive(Debug, Clone)]
struct Selection {
  model: String,
  confidence: ConfidenceThreshold,
}

/// 一个浏览器会话：运行状态、当前选择、显示槽和提示
pub struct Session {
  id: Uuid,
  pub state: SessionState,
  pub display: DisplaySlot,
  selection: Mutex<Selection>,
  notice: Mutex<Option<Notice>>,
  created_at: DateTime<Utc>,
  last_seen: Mutex<Instant>,
  /// 尚未结束的采集线程数
  workers: AtomicUsize,
}

impl Session {
  pub fn new(id: Uuid, model: String, draw: Arc<Draw>, jpeg_quality: u8) -> Self {
    Self {
      id,
      state: SessionState::new(),
      display: DisplaySlot::new(draw, jpeg_quality),
      selection: Mutex::new(Selection {
        model,
        confidence: ConfidenceThreshold::default(),
      }),
      notice: Mutex::new(None),
      created_at: Utc::now(),
      last_seen: Mutex::new(Instant::now()),
      workers: AtomicUsize::new(0),
    }
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  pub fn model(&self) -> String {
    lock(&self.selection).model.clone()
  }

  pub fn confidence(&self) -> ConfidenceThreshold {
    lock(&self.selection).confidence
  }

  pub fn select(&self, model: Option<String>, confidence: Option<ConfidenceThreshold>) {
    let mut selection = lock(&self.selection);
    if let Some(model) = model {
      selection.model = model;
    }
    if let Some(confidence) = confidence {
      selection.confidence = confidence;
    }
  }

  pub fn notice(&self) -> Option<Notice> {
    lock(&self.notice).clone()
  }

  pub fn set_notice(&self, notice: Notice) {
    *lock(&self.notice) = Some(notice);
  }

  /// 记录一次来自页面的请求
  pub fn touch(&self) {
    *lock(&self.last_seen) = Instant::now();
  }

  pub fn idle_for(&self) -> Duration {
    lock(&self.last_seen).elapsed()
  }

  pub fn capture_started(&self) {
    self.workers.fetch_add(1, Ordering::SeqCst);
  }

  /// 采集线程的最后一步，提示和最后一帧此时都已发布
  pub fn capture_finished(&self) {
    self.workers.fetch_sub(1, Ordering::SeqCst);
  }

  /// 是否还有采集线程在运行
  pub fn is_capturing(&self) -> bool {
    self.workers.load(Ordering::SeqCst) > 0
  }
}

#[derive(Default)]
pub struct SessionRegistry {
  sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
  pub fn create(&self, model: String, draw: Arc<Draw>, jpeg_quality: u8) -> Arc<Session> {
    let session = Arc::new(Session::new(Uuid::new_v4(), model, draw, jpeg_quality));
    lock(&self.sessions).insert(session.id, Arc::clone(&session));
    info!("新会话: {}", session.id);
    session
  }

  pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
    lock(&self.sessions).get(&id).cloned()
  }

  /// 移除会话并让它的采集循环在当前帧结束后退出
  pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
    let session = lock(&self.sessions).remove(&id)?;
    session.state.reset();
    info!("会话结束: {}", id);
    Some(session)
  }

  pub fn len(&self) -> usize {
    lock(&self.sessions).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 回收空闲超过 `idle` 的会话，返回被回收的会话
  pub fn reap_idle(&self, idle: Duration) -> Vec<Uuid> {
    let expired = lock(&self.sessions)
      .values()
      .filter(|session| session.idle_for() >= idle)
      .map(|session| session.id)
      .collect::<Vec<_>>();

    for id in &expired {
      if self.remove(*id).is_some() {
        info!("会话空闲超时: {}", id);
      }
    }
    expired
  }

  pub fn stop_all(&self) {
    for session in lock(&self.sessions).values() {
      session.state.stop();
    }
  }
}
