use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EvaluationParams;
use crate::models::evaluation::EvaluationResult;

/// 当前检查点格式版本
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// 批次检查点
///
/// 同一个检查点的生命周期内 `config_fingerprint` 不会改变；
/// 指纹不一致时整个检查点作废，而不是部分复用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub schema_version: u32,
    pub project_id: String,
    pub config_fingerprint: String,
    /// 批次开始时的评估参数快照
    pub params: EvaluationParams,
    pub progress: CheckpointProgress,
    /// 已完成条目的结果
    #[serde(default)]
    pub results: BTreeMap<String, EvaluationResult>,
    pub metadata: CheckpointMetadata,
}

/// 进度记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointProgress {
    /// 批次中的全部条目
    pub known_items: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    /// 失败条目及原因
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_resumed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume_count: u32,
}

impl BatchCheckpoint {
    /// 已完成或已失败的条目数
    pub fn settled_count(&self) -> usize {
        self.progress.completed.len()
            + self
                .progress
                .failed
                .keys()
                .filter(|id| !self.progress.completed.contains(*id))
                .count()
    }

    /// 全部条目是否都已有结论（成功或失败）
    pub fn all_settled(&self) -> bool {
        self.progress.known_items.iter().all(|id| {
            self.progress.completed.contains(id) || self.progress.failed.contains_key(id)
        })
    }
}
