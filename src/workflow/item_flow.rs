//! 条目处理流程 - 流程层
//!
//! 核心职责：定义"一张照片"的完整处理流程
//!
//! 流程顺序：
//! 1. 读取照片，计算内容指纹
//! 2. 查缓存，命中则直接返回（不占槽位，不调用推理服务）
//! 3. 未命中：获取槽位 → 调用推理服务（按重试策略）→ 上报延迟 → 归还槽位
//! 4. 成功后写缓存（失败只记日志）

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::EvaluationParams;
use crate::models::{CacheKey, CacheMetadata, EvaluationResult, ItemPayload, PhotoItem};
use crate::services::{
    config_fingerprint, ConcurrencyGovernor, ContentCache, ItemEvaluator, RetryPolicy,
};
use crate::workflow::item_ctx::ItemCtx;

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// 缓存命中
    CacheHit(EvaluationResult),
    /// 调用推理服务成功
    Evaluated {
        result: EvaluationResult,
        attempts: u32,
    },
    /// 重试用尽（或不可重试）后失败
    Failed { reason: String, attempts: u32 },
}

impl ItemOutcome {
    pub fn result(&self) -> Option<&EvaluationResult> {
        match self {
            ItemOutcome::CacheHit(result) | ItemOutcome::Evaluated { result, .. } => Some(result),
            ItemOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result().is_some()
    }
}

/// 条目处理流程
///
/// - 不持有批次状态，只处理一张照片
/// - 缓存、槽位、重试全部在这里串起来
pub struct ItemFlow {
    evaluator: Arc<dyn ItemEvaluator>,
    cache: Option<Arc<ContentCache>>,
    governor: ConcurrencyGovernor,
    retry: RetryPolicy,
    params: EvaluationParams,
    params_fingerprint: String,
}

impl ItemFlow {
    pub fn new(
        evaluator: Arc<dyn ItemEvaluator>,
        cache: Option<Arc<ContentCache>>,
        governor: ConcurrencyGovernor,
        retry: RetryPolicy,
        params: EvaluationParams,
    ) -> Self {
        let params_fingerprint = config_fingerprint(&params);
        Self {
            evaluator,
            cache,
            governor,
            retry,
            params,
            params_fingerprint,
        }
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    fn cache_key(&self, payload: &ItemPayload) -> CacheKey {
        CacheKey::derive(
            &payload.fingerprint(),
            &self.params_fingerprint,
            &self.params.model_id,
        )
    }

    pub async fn run(&self, item: &PhotoItem, ctx: &ItemCtx) -> ItemOutcome {
        let payload = match item.load_payload().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} ⚠️ 无法读取照片: {}", ctx, e);
                return ItemOutcome::Failed {
                    reason: e.to_string(),
                    attempts: 0,
                };
            }
        };

        let key = self.cache_key(&payload);
        if let Some(cache) = &self.cache {
            if let Some(result) = cache.get(&key).await {
                info!("{} 💾 命中缓存 (得分 {:.1})", ctx, result.score);
                return ItemOutcome::CacheHit(result);
            }
        }

        let label = ctx.to_string();
        let label_ref = label.as_str();
        let payload = &payload;
        let mut attempts = 0;
        let outcome = self
            .retry
            .run(&label, |attempt| {
                attempts = attempt;
                async move {
                    let slot = self.governor.acquire().await;
                    debug!("{} 第 {} 次调用，槽位 #{}", label_ref, attempt, slot.id());
                    let started = Instant::now();
                    let result = self.evaluator.evaluate(payload, &self.params).await;
                    self.governor.report_latency(&slot, started.elapsed());
                    self.governor.release(slot);
                    result
                }
            })
            .await;

        match outcome {
            Ok(result) => {
                info!("{} ✓ 评估完成 (得分 {:.1})", ctx, result.score);
                self.memoize(&key, &result, ctx).await;
                ItemOutcome::Evaluated { result, attempts }
            }
            Err(e) => {
                warn!("{} ❌ 评估失败: {}", ctx, e);
                ItemOutcome::Failed {
                    reason: e.to_string(),
                    attempts,
                }
            }
        }
    }

    /// 写缓存；失败不影响本次结果
    async fn memoize(&self, key: &CacheKey, result: &EvaluationResult, ctx: &ItemCtx) {
        let Some(cache) = &self.cache else {
            return;
        };
        let metadata = CacheMetadata {
            item_id: ctx.item_id.clone(),
            model_id: self.params.model_id.clone(),
        };
        if let Err(e) = cache.put(key, result, metadata).await {
            warn!("{} ⚠️ 写入缓存失败，结果未缓存: {}", ctx, e);
        }
    }
}
