//! 检查点存储 - 业务能力层
//!
//! 负责批次进度的持久化与恢复：
//! - 读取时容忍文件缺失或损坏（视为没有检查点）
//! - 校验从不报错，只返回 `valid=false` 和可读的原因
//! - 保存是原子的，进程中途崩溃也不会留下半个文件
//! - 更新是集合合并，与完成顺序无关

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::EvaluationParams;
use crate::error::CheckpointError;
use crate::infrastructure::{fingerprint, write_atomic};
use crate::models::checkpoint::CHECKPOINT_SCHEMA_VERSION;
use crate::models::{
    BatchCheckpoint, BatchStatus, CheckpointMetadata, CheckpointProgress, EvaluationResult,
};

/// 配置指纹
///
/// 与键顺序无关；评估参数任何语义变化都会改变结果。
pub fn config_fingerprint(params: &EvaluationParams) -> String {
    // EvaluationParams 只包含可序列化的普通字段，这里不会失败
    fingerprint(params).unwrap_or_else(|e| {
        warn!("评估参数序列化失败，使用空指纹: {}", e);
        String::new()
    })
}

/// 检查点校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointValidation {
    pub valid: bool,
    pub reason: String,
}

impl CheckpointValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: "检查点有效".to_string(),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// 检查点存储
///
/// 每个项目一个检查点文件，假定同一时间只有一个写入进程。
pub struct CheckpointStore {
    path: PathBuf,
    staleness: ChronoDuration,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, staleness_days: i64) -> Self {
        Self {
            path: path.into(),
            staleness: ChronoDuration::days(staleness_days),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取检查点，缺失或损坏时返回 None
    pub async fn load(&self) -> Option<BatchCheckpoint> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("没有找到检查点: {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("⚠️ 读取检查点失败 ({}): {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice::<BatchCheckpoint>(&data) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!("⚠️ 检查点已损坏，忽略 ({}): {}", self.path.display(), e);
                None
            }
        }
    }

    /// 校验检查点能否用于当前配置
    pub fn validate(
        &self,
        checkpoint: &BatchCheckpoint,
        project_id: &str,
        params: &EvaluationParams,
    ) -> CheckpointValidation {
        self.validate_at(checkpoint, project_id, params, Utc::now())
    }

    pub fn validate_at(
        &self,
        checkpoint: &BatchCheckpoint,
        project_id: &str,
        params: &EvaluationParams,
        now: DateTime<Utc>,
    ) -> CheckpointValidation {
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return CheckpointValidation::invalid(format!(
                "检查点版本不匹配: 期望 {}, 实际 {}",
                CHECKPOINT_SCHEMA_VERSION, checkpoint.schema_version
            ));
        }
        if checkpoint.project_id.trim().is_empty() {
            return CheckpointValidation::invalid("检查点缺少项目标识");
        }
        if checkpoint.config_fingerprint.trim().is_empty() {
            return CheckpointValidation::invalid("检查点缺少配置指纹");
        }
        if checkpoint.project_id != project_id {
            return CheckpointValidation::invalid(format!(
                "项目不匹配: 检查点属于 {}, 当前项目 {}",
                checkpoint.project_id, project_id
            ));
        }

        let current = config_fingerprint(params);
        if checkpoint.config_fingerprint != current {
            return CheckpointValidation::invalid(format!(
                "配置已变更: 检查点指纹 {}, 当前指纹 {}",
                short(&checkpoint.config_fingerprint),
                short(&current)
            ));
        }

        if let Some(unknown) = checkpoint
            .progress
            .completed
            .iter()
            .find(|id| !checkpoint.progress.known_items.contains(*id))
        {
            return CheckpointValidation::invalid(format!(
                "检查点不一致: 已完成条目 {} 不在条目集合中",
                unknown
            ));
        }

        let age = now.signed_duration_since(checkpoint.metadata.created_at);
        if age > self.staleness {
            return CheckpointValidation::invalid(format!(
                "检查点已过期: 创建于 {} 天前，上限 {} 天",
                age.num_days(),
                self.staleness.num_days()
            ));
        }

        CheckpointValidation::ok()
    }

    /// 原子保存
    pub async fn save(&self, checkpoint: &BatchCheckpoint) -> Result<(), CheckpointError> {
        let data = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::SerializeFailed { source: e })?;

        write_atomic(&self.path, &data)
            .await
            .map_err(|e| CheckpointError::WriteFailed {
                path: self.path.display().to_string(),
                source: e,
            })?;

        debug!(
            "检查点已保存: 已结束 {}/{}",
            checkpoint.settled_count(),
            checkpoint.progress.known_items.len()
        );
        Ok(())
    }

    /// 删除检查点，只在批次完成后调用；文件不存在不算错误
    pub async fn delete(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("🗑️ 批次已完成，检查点已删除");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::DeleteFailed {
                path: self.path.display().to_string(),
                source: e,
            }),
        }
    }

    /// 创建空进度的新检查点
    pub fn initialize<I, S>(project_id: &str, params: &EvaluationParams, item_ids: I) -> BatchCheckpoint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        BatchCheckpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            project_id: project_id.to_string(),
            config_fingerprint: config_fingerprint(params),
            params: params.clone(),
            progress: CheckpointProgress {
                known_items: item_ids.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
            results: BTreeMap::new(),
            metadata: CheckpointMetadata {
                created_at: now,
                updated_at: now,
                last_resumed_at: None,
                resume_count: 0,
            },
        }
    }

    /// 合并新完成的条目和结果
    ///
    /// 只增不减：之前记录的条目不会丢失。不在条目集合中的 ID 会被忽略。
    pub fn update<I>(
        mut checkpoint: BatchCheckpoint,
        newly_completed: I,
        new_results: BTreeMap<String, EvaluationResult>,
    ) -> BatchCheckpoint
    where
        I: IntoIterator<Item = String>,
    {
        for id in newly_completed {
            if !checkpoint.progress.known_items.contains(&id) {
                warn!("忽略未知条目的完成记录: {}", id);
                continue;
            }
            checkpoint.progress.failed.remove(&id);
            checkpoint.progress.completed.insert(id);
        }

        for (id, result) in new_results {
            if checkpoint.progress.completed.contains(&id) {
                checkpoint.results.insert(id, result);
            }
        }

        checkpoint.metadata.updated_at = Utc::now();
        refresh_status(&mut checkpoint);
        checkpoint
    }

    /// 记录失败条目；已完成的条目不会被标记为失败
    pub fn record_failures(
        mut checkpoint: BatchCheckpoint,
        failures: BTreeMap<String, String>,
    ) -> BatchCheckpoint {
        for (id, reason) in failures {
            if checkpoint.progress.known_items.contains(&id)
                && !checkpoint.progress.completed.contains(&id)
            {
                checkpoint.progress.failed.insert(id, reason);
            }
        }
        checkpoint.metadata.updated_at = Utc::now();
        refresh_status(&mut checkpoint);
        checkpoint
    }

    /// 标记一次恢复：上次失败的条目会重新尝试
    pub fn mark_resumed(mut checkpoint: BatchCheckpoint) -> BatchCheckpoint {
        let now = Utc::now();
        checkpoint.progress.failed.clear();
        checkpoint.metadata.last_resumed_at = Some(now);
        checkpoint.metadata.resume_count += 1;
        checkpoint.metadata.updated_at = now;
        refresh_status(&mut checkpoint);
        checkpoint
    }
}

fn refresh_status(checkpoint: &mut BatchCheckpoint) {
    checkpoint.progress.status = if checkpoint.all_settled() {
        BatchStatus::Complete
    } else {
        BatchStatus::InProgress
    };
}

/// 按字符截取指纹前 12 位，检查点文件里的指纹可能不是 ASCII
fn short(fingerprint: &str) -> &str {
    fingerprint
        .char_indices()
        .nth(12)
        .map_or(fingerprint, |(i, _)| &fingerprint[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemTags;

    fn result(score: f64) -> EvaluationResult {
        EvaluationResult {
            score,
            tags: ItemTags::default(),
            summary: String::new(),
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img_{:02}.jpg", i)).collect()
    }

    fn store_in(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("checkpoint.json"), 7)
    }

    #[test]
    fn test_fingerprint_tracks_params() {
        let base = EvaluationParams::default();
        let mut changed = base.clone();
        changed.temperature = 0.9;
        let mut hinted = base.clone();
        hinted.style_hint = Some("film".to_string());

        assert_eq!(config_fingerprint(&base), config_fingerprint(&base.clone()));
        assert_ne!(config_fingerprint(&base), config_fingerprint(&changed));
        assert_ne!(config_fingerprint(&base), config_fingerprint(&hinted));
    }

    #[test]
    fn test_update_merges_in_any_order() {
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(4));

        let a = CheckpointStore::update(
            cp.clone(),
            vec![ids(4)[2].clone()],
            BTreeMap::from([(ids(4)[2].clone(), result(2.0))]),
        );
        let a = CheckpointStore::update(
            a,
            vec![ids(4)[0].clone()],
            BTreeMap::from([(ids(4)[0].clone(), result(0.0))]),
        );

        let b = CheckpointStore::update(
            cp,
            vec![ids(4)[0].clone(), ids(4)[2].clone()],
            BTreeMap::from([
                (ids(4)[0].clone(), result(0.0)),
                (ids(4)[2].clone(), result(2.0)),
            ]),
        );

        assert_eq!(a.progress.completed, b.progress.completed);
        assert_eq!(a.results, b.results);
        assert_eq!(a.progress.status, BatchStatus::InProgress);
    }

    #[test]
    fn test_update_never_loses_items_and_ignores_unknown() {
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(3));
        let cp = CheckpointStore::update(cp, vec![ids(3)[0].clone()], BTreeMap::new());
        let cp = CheckpointStore::update(cp, vec!["ghost.jpg".to_string()], BTreeMap::new());
        let cp = CheckpointStore::update(cp, Vec::new(), BTreeMap::new());

        assert!(cp.progress.completed.contains(&ids(3)[0]));
        assert!(!cp.progress.completed.contains("ghost.jpg"));
        assert_eq!(cp.progress.completed.len(), 1);
    }

    #[test]
    fn test_status_complete_when_all_settled() {
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(2));
        let cp = CheckpointStore::update(cp, vec![ids(2)[0].clone()], BTreeMap::new());
        let cp = CheckpointStore::record_failures(
            cp,
            BTreeMap::from([(ids(2)[1].clone(), "timeout".to_string())]),
        );
        assert_eq!(cp.progress.status, BatchStatus::Complete);

        let resumed = CheckpointStore::mark_resumed(cp);
        assert_eq!(resumed.progress.status, BatchStatus::InProgress);
        assert_eq!(resumed.metadata.resume_count, 1);
        assert!(resumed.metadata.last_resumed_at.is_some());
    }

    #[test]
    fn test_validate_detects_config_drift() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(2));

        assert!(store.validate(&cp, "p", &params).valid);

        let mut drifted = params.clone();
        drifted.prompt_version = "v2".to_string();
        let validation = store.validate(&cp, "p", &drifted);
        assert!(!validation.valid);
        assert!(validation.reason.contains("配置已变更"));

        assert!(!store.validate(&cp, "other", &params).valid);
    }

    #[test]
    fn test_validate_staleness_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(1));

        let later = cp.metadata.created_at + ChronoDuration::days(8);
        assert!(!store.validate_at(&cp, "p", &params, later).valid);

        let mut old_schema = cp.clone();
        old_schema.schema_version = 0;
        assert!(!store.validate(&old_schema, "p", &params).valid);

        let mut missing = cp;
        missing.config_fingerprint.clear();
        assert!(!store.validate(&missing, "p", &params).valid);
    }

    #[test]
    fn test_validate_non_ascii_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let params = EvaluationParams::default();
        let mut cp = CheckpointStore::initialize("p", &params, ids(1));
        cp.config_fingerprint = "aéééééééééééééé".to_string();

        let validation = store.validate(&cp, "p", &params);
        assert!(!validation.valid);
        assert!(validation.reason.contains("配置已变更"));
        assert_eq!(short("aéééééééééééééé").chars().count(), 12);
        assert_eq!(short("abc"), "abc");
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let params = EvaluationParams::default();
        let cp = CheckpointStore::initialize("p", &params, ids(3));
        let cp = CheckpointStore::update(
            cp,
            vec![ids(3)[1].clone()],
            BTreeMap::from([(ids(3)[1].clone(), result(7.5))]),
        );

        assert!(store.load().await.is_none());
        store.save(&cp).await.unwrap();
        assert_eq!(store.load().await.unwrap(), cp);

        store.delete().await.unwrap();
        assert!(store.load().await.is_none());
        // 重复删除不报错
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), b"{\"schema_version\": 1, \"project_")
            .await
            .unwrap();
        assert!(store.load().await.is_none());
    }
}
