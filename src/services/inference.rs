//! 推理协作方接口
//!
//! 编排器和组合优化器只依赖这两个 trait，通过构造函数注入具体实现；
//! 生产环境使用 [`crate::services::LlmService`]，测试中替换为计数的桩实现。

use async_trait::async_trait;

use crate::config::EvaluationParams;
use crate::error::InferenceError;
use crate::models::{EvaluationResult, GroupResult, ItemPayload};

/// 单张照片评估
///
/// 假定对相同的 (载荷, 参数) 是幂等的，这是内容缓存正确性的前提。
#[async_trait]
pub trait ItemEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        payload: &ItemPayload,
        params: &EvaluationParams,
    ) -> Result<EvaluationResult, InferenceError>;
}

/// 照片组整体评估，只在组合优化的昂贵评分阶段调用
#[async_trait]
pub trait GroupEvaluator: Send + Sync {
    async fn evaluate_group(
        &self,
        payloads: &[ItemPayload],
        params: &EvaluationParams,
    ) -> Result<GroupResult, InferenceError>;
}
