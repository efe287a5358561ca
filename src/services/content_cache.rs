//! 内容缓存 - 业务能力层
//!
//! 以 (照片指纹, 参数指纹, 模型) 为键的记忆化存储，每个键一个 JSON 文件。
//! 没有自动淘汰：条目一直保留到显式 `clear()`。配置频繁变化时目录会持续增长，
//! 这一点通过 `stats()` 暴露给调用方，由调用方提示用户手动清理。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::infrastructure::atomic_file::is_temp_file;
use crate::infrastructure::write_atomic;
use crate::models::{CacheEntry, CacheKey, CacheMetadata, EvaluationResult};

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub bytes_on_disk: u64,
    /// 本进程内的命中 / 未命中次数
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// 条目数是否超过提示阈值
    pub over_warning_threshold: bool,
}

/// 内容缓存
pub struct ContentCache {
    dir: PathBuf,
    warn_entry_count: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>, warn_entry_count: usize) -> Self {
        Self {
            dir: dir.into(),
            warn_entry_count,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// 查询缓存；命中时顺带累加条目的命中计数
    pub async fn get(&self, key: &CacheKey) -> Option<EvaluationResult> {
        let path = self.entry_path(key);
        let entry = match fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<CacheEntry>(&data) {
                Ok(entry) if &entry.key == key => Some(entry),
                Ok(_) => {
                    warn!("缓存条目键不一致，忽略: {}", path.display());
                    None
                }
                Err(e) => {
                    warn!("缓存条目已损坏，忽略 ({}): {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("读取缓存条目失败 ({}): {}", path.display(), e);
                None
            }
        };

        let Some(mut entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        entry.hit_count += 1;
        let result = entry.result.clone();

        // 命中计数只是统计信息，写回失败不影响结果
        if let Err(e) = self.write_entry(&entry).await {
            debug!("更新缓存命中计数失败: {}", e);
        }

        Some(result)
    }

    /// 写入缓存条目（原子写入）
    pub async fn put(
        &self,
        key: &CacheKey,
        result: &EvaluationResult,
        metadata: CacheMetadata,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry {
            key: key.clone(),
            result: result.clone(),
            created_at: Utc::now(),
            hit_count: 0,
            metadata,
        };
        self.write_entry(&entry).await
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(entry).map_err(|e| CacheError::SerializeFailed {
            key: entry.key.to_string(),
            source: e,
        })?;

        write_atomic(&self.entry_path(&entry.key), &data)
            .await
            .map_err(|e| CacheError::WriteFailed {
                key: entry.key.to_string(),
                source: e,
            })
    }

    /// 统计条目数、占用空间和命中率
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let mut stats = CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            ..Default::default()
        };

        for path in self.entry_files().await? {
            stats.entry_count += 1;
            if let Ok(meta) = fs::metadata(&path).await {
                stats.bytes_on_disk += meta.len();
            }
        }
        stats.over_warning_threshold = stats.entry_count > self.warn_entry_count;

        Ok(stats)
    }

    /// 删除所有缓存条目，返回删除数量
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.entry_files().await? {
            fs::remove_file(&path)
                .await
                .map_err(|e| CacheError::ClearFailed {
                    path: path.display().to_string(),
                    source: e,
                })?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let dir_err = |e: std::io::Error| CacheError::DirectoryUnavailable {
            path: self.dir.display().to_string(),
            source: e,
        };

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(dir_err(e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") && !is_temp_file(&path)
            {
                files.push(path);
            }
        }
        Ok(files)
    }
}
