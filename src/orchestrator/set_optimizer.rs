//! 组合优化器 - 编排层
//!
//! 从 N 张已评分照片中选出恰好 K 张的最优组合，不做全量枚举：
//!
//! 1. **预筛选**：按个体质量降序取前 M 张
//! 2. **安全上限**：先算 C(M, K)，超过上限立即报错，不开始枚举
//! 3. **廉价评分**：枚举 C(M, K) 个组合，质量和 + 多样性加分，不调用外部服务
//! 4. **昂贵评分**：只把前 P 个组合交给整体评估服务，按权重合成综合分

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EvaluationParams;
use crate::error::{AppError, AppResult, OptimizerError};
use crate::models::{CandidateSet, ItemPayload, PhotoItem, ScoredItem};
use crate::services::{GroupEvaluator, RetryPolicy};

/// 组合优化配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    /// 组合大小 K
    pub subset_size: usize,
    /// 预筛选保留的候选数 M
    pub candidate_pool: usize,
    /// 组合数上限
    pub max_combinations: u64,
    /// 送去整体评估的组合数 P
    pub group_top_p: usize,
    pub weights: ScoreWeights,
    pub diversity: DiversityWeights,
}

/// 综合分权重
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub individual: f64,
    pub group: f64,
}

/// 多样性加分中各维度的权重
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityWeights {
    pub subject: f64,
    pub tone: f64,
    pub style: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subset_size: 4,
            candidate_pool: 20,
            max_combinations: 10_000,
            group_top_p: 5,
            weights: ScoreWeights::default(),
            diversity: DiversityWeights::default(),
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            individual: 0.6,
            group: 0.4,
        }
    }
}

impl Default for DiversityWeights {
    fn default() -> Self {
        Self {
            subject: 1.0,
            tone: 1.0,
            style: 1.0,
        }
    }
}

impl OptimizerConfig {
    /// 调用方显式调整组合数上限
    pub fn with_max_combinations(mut self, max_combinations: u64) -> Self {
        self.max_combinations = max_combinations;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.subset_size == 0 {
            return Err(AppError::invalid_config("optimizer.subset_size", "至少为 1"));
        }
        if self.candidate_pool == 0 {
            return Err(AppError::invalid_config(
                "optimizer.candidate_pool",
                "至少为 1",
            ));
        }
        if self.max_combinations == 0 {
            return Err(AppError::invalid_config(
                "optimizer.max_combinations",
                "至少为 1",
            ));
        }
        let w = &self.weights;
        if w.individual < 0.0 || w.group < 0.0 || w.individual + w.group <= 0.0 {
            return Err(AppError::invalid_config(
                "optimizer.weights",
                "权重不能为负，且不能全为 0",
            ));
        }
        let d = &self.diversity;
        if d.subject < 0.0 || d.tone < 0.0 || d.style < 0.0 {
            return Err(AppError::invalid_config(
                "optimizer.diversity",
                "多样性权重不能为负",
            ));
        }
        Ok(())
    }
}

/// 组合数 C(n, k)，溢出时返回 None
pub fn binomial(n: usize, k: usize) -> Option<u128> {
    if k > n {
        return Some(0);
    }
    let k = k.min(n - k) as u128;
    let n = n as u128;
    let mut result: u128 = 1;
    for i in 0..k {
        // 每一步都是整数：result * (n - i) 能被 (i + 1) 整除
        result = result.checked_mul(n - i)? / (i + 1);
    }
    Some(result)
}

/// 组合优化器
pub struct SetCombinationOptimizer {
    config: OptimizerConfig,
    evaluator: Arc<dyn GroupEvaluator>,
    retry: RetryPolicy,
    params: EvaluationParams,
}

impl SetCombinationOptimizer {
    pub fn new(
        config: OptimizerConfig,
        evaluator: Arc<dyn GroupEvaluator>,
        retry: RetryPolicy,
        params: EvaluationParams,
    ) -> Self {
        Self {
            config,
            evaluator,
            retry,
            params,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// 预筛选：质量降序，同分按 ID 升序，保留前 M 个
    pub fn prefilter(&self, items: &[ScoredItem]) -> Vec<ScoredItem> {
        let mut sorted = dedupe_by_id(items);
        sorted.sort_by(|a, b| {
            b.quality
                .total_cmp(&a.quality)
                .then_with(|| a.id.cmp(&b.id))
        });
        sorted.truncate(self.config.candidate_pool);
        sorted
    }

    /// 检查组合数是否在上限内，返回组合数
    pub fn check_ceiling(&self, pool: usize) -> Result<u128, OptimizerError> {
        let k = self.config.subset_size;
        let ceiling = self.config.max_combinations as u128;
        // 溢出说明远超上限
        let combinations = binomial(pool, k).unwrap_or(u128::MAX);
        if combinations > ceiling {
            return Err(OptimizerError::CombinationCeilingExceeded {
                pool,
                k,
                combinations,
                ceiling,
            });
        }
        Ok(combinations)
    }

    /// 廉价评分：枚举所有组合，按廉价分降序排列
    pub fn cheap_rank(&self, pool: &[ScoredItem]) -> Result<Vec<CandidateSet>, OptimizerError> {
        let k = self.config.subset_size;
        if k == 0 || pool.len() < k {
            return Err(OptimizerError::InvalidSelection {
                available: pool.len(),
                k,
            });
        }
        let expected = self.check_ceiling(pool.len())?;

        let mut candidates = Vec::with_capacity(expected as usize);
        let mut indices: Vec<usize> = (0..k).collect();
        loop {
            candidates.push(self.cheap_candidate(pool, &indices));
            if !next_combination(&mut indices, pool.len()) {
                break;
            }
        }
        debug!("廉价评分完成: {} 个组合", candidates.len());

        candidates.sort_by(|a, b| {
            b.cheap_score()
                .total_cmp(&a.cheap_score())
                .then_with(|| a.item_ids.cmp(&b.item_ids))
        });
        Ok(candidates)
    }

    fn cheap_candidate(&self, pool: &[ScoredItem], indices: &[usize]) -> CandidateSet {
        let members: Vec<&ScoredItem> = indices.iter().map(|&i| &pool[i]).collect();
        let quality_sum = members.iter().map(|m| m.quality).sum();
        let diversity_bonus = self.diversity_bonus(&members);
        let mut candidate = CandidateSet {
            item_ids: members.iter().map(|m| m.id.clone()).collect(),
            quality_sum,
            diversity_bonus,
            group_score: None,
            composite_score: 0.0,
            group_failed: false,
        };
        candidate.composite_score = candidate.cheap_score() / members.len() as f64;
        candidate
    }

    /// 多样性加分：每个维度 (不同取值数 - 1) / (K - 1)，再按维度加权
    fn diversity_bonus(&self, members: &[&ScoredItem]) -> f64 {
        if members.len() < 2 {
            return 0.0;
        }
        let spread = |values: BTreeSet<&str>| (values.len() - 1) as f64 / (members.len() - 1) as f64;
        let w = &self.config.diversity;

        let subjects = members.iter().map(|m| m.tags.subject.as_str()).collect();
        let tones = members.iter().map(|m| m.tags.tone.as_str()).collect();
        let styles = members.iter().map(|m| m.tags.style.as_str()).collect();

        w.subject * spread(subjects) + w.tone * spread(tones) + w.style * spread(styles)
    }

    /// 完整优化：预筛选 → 上限检查 → 廉价评分 → 整体评估
    ///
    /// `photos` 用于为整体评估读取照片内容。返回按综合分降序的前 P 个组合。
    pub async fn optimize(
        &self,
        items: &[ScoredItem],
        photos: &HashMap<String, PhotoItem>,
    ) -> Result<Vec<CandidateSet>, OptimizerError> {
        let available = dedupe_by_id(items).len();
        let k = self.config.subset_size;
        if k == 0 || available < k {
            return Err(OptimizerError::InvalidSelection { available, k });
        }

        let pool = self.prefilter(items);
        let combinations = self.check_ceiling(pool.len())?;
        info!(
            "🧮 组合优化: 从 {} 个候选中选 {} 个，共 {} 个组合",
            pool.len(),
            k,
            combinations
        );

        let mut ranked = self.cheap_rank(&pool)?;
        ranked.truncate(self.config.group_top_p.max(1));

        let scored = join_all(
            ranked
                .into_iter()
                .map(|candidate| self.score_with_group(candidate, photos)),
        )
        .await;

        let mut result = scored;
        result.sort_by(|a, b| {
            b.composite_score
                .total_cmp(&a.composite_score)
                .then_with(|| a.item_ids.cmp(&b.item_ids))
        });

        if let Some(best) = result.first() {
            info!(
                "🏆 最佳组合: {:?} (综合分 {:.2})",
                best.item_ids, best.composite_score
            );
        }
        Ok(result)
    }

    /// 昂贵评分：整体评估失败时综合分只取个体部分，候选保留并标记
    async fn score_with_group(
        &self,
        mut candidate: CandidateSet,
        photos: &HashMap<String, PhotoItem>,
    ) -> CandidateSet {
        let k = candidate.size().max(1) as f64;
        let individual_part = candidate.cheap_score() / k;
        let weights = &self.config.weights;

        match self.group_score(&candidate, photos).await {
            Ok(group_score) => {
                candidate.group_score = Some(group_score);
                candidate.composite_score =
                    weights.individual * individual_part + weights.group * group_score;
            }
            Err(reason) => {
                warn!(
                    "⚠️ 组合 {:?} 整体评估失败，只使用个体分: {}",
                    candidate.item_ids, reason
                );
                candidate.group_failed = true;
                candidate.composite_score = individual_part;
            }
        }
        candidate
    }

    async fn group_score(
        &self,
        candidate: &CandidateSet,
        photos: &HashMap<String, PhotoItem>,
    ) -> Result<f64, String> {
        let mut payloads: Vec<ItemPayload> = Vec::with_capacity(candidate.size());
        for id in &candidate.item_ids {
            let photo = photos
                .get(id)
                .ok_or_else(|| format!("找不到照片 {}", id))?;
            payloads.push(photo.load_payload().await.map_err(|e| e.to_string())?);
        }

        let label = format!("整体评估 {:?}", candidate.item_ids);
        let payloads = payloads.as_slice();
        self.retry
            .run(&label, |_| self.evaluator.evaluate_group(payloads, &self.params))
            .await
            .map(|group| group.score)
            .map_err(|e| e.to_string())
    }
}

fn dedupe_by_id(items: &[ScoredItem]) -> Vec<ScoredItem> {
    let mut seen = BTreeSet::new();
    items
        .iter()
        .filter(|item| seen.insert(item.id.as_str()))
        .cloned()
        .collect()
}

/// 字典序下一个组合，已是最后一个时返回 false
fn next_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if indices[i] < n - k + i {
            indices[i] += 1;
            for j in i + 1..k {
                indices[j] = indices[j - 1] + 1;
            }
            return true;
        }
    }
    false
}
