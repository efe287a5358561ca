use serde::Serialize;

/// 候选组合：恰好 K 个互不重复的条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSet {
    pub item_ids: Vec<String>,
    /// 个体质量分之和
    pub quality_sum: f64,
    /// 多样性加分
    pub diversity_bonus: f64,
    /// 整体评估分；未参与或整体评估失败时为 None
    pub group_score: Option<f64>,
    /// 综合分
    pub composite_score: f64,
    /// 整体评估失败，综合分只取个体部分
    pub group_failed: bool,
}

impl CandidateSet {
    /// 廉价评分（不含整体评估）
    pub fn cheap_score(&self) -> f64 {
        self.quality_sum + self.diversity_bonus
    }

    pub fn size(&self) -> usize {
        self.item_ids.len()
    }
}
