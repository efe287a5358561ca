use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::infrastructure::sha256_hex;
use crate::models::evaluation::EvaluationResult;

/// 缓存键
///
/// 由 (条目指纹, 参数指纹, 模型标识) 唯一确定，相同三元组总是得到相同的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(item_fingerprint: &str, params_fingerprint: &str, model_id: &str) -> Self {
        // 用 NUL 分隔，避免 ("ab","c") 与 ("a","bc") 拼接后相同
        let material = format!("{}\0{}\0{}", item_fingerprint, params_fingerprint, model_id);
        Self(sha256_hex(material.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 缓存文件名
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: EvaluationResult,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
    pub metadata: CacheMetadata,
}

/// 缓存条目的附加信息（仅用于排查，不参与键计算）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub item_id: String,
    pub model_id: String,
}
