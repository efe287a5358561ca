use serde::{Deserialize, Serialize};

/// 单张照片的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// 个体质量分（0-10）
    pub score: f64,
    #[serde(default)]
    pub tags: ItemTags,
    #[serde(default)]
    pub summary: String,
}

/// 描述性标签，组合优化时用于计算多样性
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemTags {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub style: String,
}

/// 一组照片的整体评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    /// 整体分（0-10）
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

/// 已评分条目，组合优化器的输入
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub id: String,
    pub quality: f64,
    pub tags: ItemTags,
}

impl ScoredItem {
    pub fn from_result(id: impl Into<String>, result: &EvaluationResult) -> Self {
        Self {
            id: id.into(),
            quality: result.score,
            tags: result.tags.clone(),
        }
    }
}
