// 该文件是 Anfang （安防） 项目的一部分。
// src/model/loader.rs - 模型加载缓存
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
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use super::{Model, ModelError};

/// 根据权重文件路径创建检测器
pub trait ModelFactory: Send + Sync {
  fn load(&self, path: &Path) -> Result<Arc<dyn Model>, ModelError>;
}

impl<F> ModelFactory for F
where
  F: Fn(&Path) -> Result<Arc<dyn Model>, ModelError> + Send + Sync,
{
  fn load(&self, path: &Path) -> Result<Arc<dyn Model>, ModelError> {
    self(path)
  }
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型文件不存在: {}", .0.display())]
  NotFound(PathBuf),
  #[error("模型加载失败 {}: {source}", .path.display())]
  Backend {
    path: PathBuf,
    #[source]
    source: ModelError,
  },
}

/// 按路径缓存的模型加载器
///
/// 每个路径在进程生命周期内只加载一次，之后返回同一个句柄。缓存没有淘汰策略，
/// 其大小受模型选项表约束。
pub struct ModelCache {
  factory: Box<dyn ModelFactory>,
  handles: Mutex<HashMap<PathBuf, Arc<dyn Model>>>,
}

impl ModelCache {
  pub fn new(factory: impl ModelFactory + 'static) -> Self {
    Self {
      factory: Box::new(factory),
      handles: Mutex::new(HashMap::new()),
    }
  }

  pub fn load(&self, path: &Path) -> Result<Arc<dyn Model>, LoadError> {
    // 加载期间持有锁，保证并发的首次请求也只加载一次
    let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(handle) = handles.get(path) {
      debug!("模型缓存命中: {}", path.display());
      return Ok(Arc::clone(handle));
    }

    if !path.exists() {
      return Err(LoadError::NotFound(path.to_path_buf()));
    }

    info!("加载模型文件: {}", path.display());
    let now = Instant::now();
    let handle = self.factory.load(path).map_err(|source| LoadError::Backend {
      path: path.to_path_buf(),
      source,
    })?;
    info!("模型 {} 加载完成，耗时: {:.2?}", handle.name(), now.elapsed());

    handles.insert(path.to_path_buf(), Arc::clone(&handle));
    Ok(handle)
  }

  pub fn is_cached(&self, path: &Path) -> bool {
    self
      .handles
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(path)
  }

  pub fn len(&self) -> usize {
    self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::{
    config::ConfidenceThreshold,
    frame::{ChannelOrder, Frame},
    model::{DetectResult, InferenceError},
  };

  struct Dummy;

  impl Model for Dummy {
    fn name(&self) -> &str {
      "dummy"
    }

    fn channel_order(&self) -> ChannelOrder {
      ChannelOrder::Rgb
    }

    fn infer(&self, _: &Frame, _: ConfidenceThreshold) -> Result<DetectResult, InferenceError> {
      Ok(DetectResult::default())
    }
  }

  fn counting_cache() -> (ModelCache, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cache = ModelCache::new(move |_: &Path| -> Result<Arc<dyn Model>, ModelError> {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Arc::new(Dummy))
    });
    (cache, calls)
  }

  #[test]
  fn same_path_returns_same_handle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("best_yolo11n.pt");
    std::fs::write(&path, b"weights").unwrap();

    let (cache, calls) = counting_cache();
    let first = cache.load(&path).unwrap();
    let second = cache.load(&path).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_cached(&path));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn distinct_paths_load_separately() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.pt");
    let b = dir.path().join("b.pt");
    std::fs::write(&a, b"a").unwrap();
    std::fs::write(&b, b"b").unwrap();

    let (cache, calls) = counting_cache();
    let first = cache.load(&a).unwrap();
    let second = cache.load(&b).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn missing_file_is_not_found_without_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.pt");

    let (cache, calls) = counting_cache();
    let err = cache.load(&path).err().unwrap();

    assert!(matches!(err, LoadError::NotFound(p) if p == path));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(cache.is_empty());
  }

  #[test]
  fn factory_failure_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.pt");
    std::fs::write(&path, b"").unwrap();

    let cache = ModelCache::new(|_: &Path| -> Result<Arc<dyn Model>, ModelError> {
      Err(ModelError::Invalid("empty".into()))
    });

    assert!(matches!(cache.load(&path), Err(LoadError::Backend { .. })));
    assert!(!cache.is_cached(&path));
  }
}
