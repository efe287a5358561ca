//! 业务能力层（Service Layer）
//!
//! 每个服务只提供一种能力，不关心批次流程：
//! - `checkpoint_store`: 批次进度的持久化与校验
//! - `content_cache`: 按内容寻址的评估结果缓存
//! - `concurrency_governor`: 自适应并发槽位
//! - `retry`: 统一的重试策略
//! - `inference`: 推理协作方接口
//! - `llm_service`: 基于 OpenAI 兼容接口的推理实现

pub mod checkpoint_store;
pub mod concurrency_governor;
pub mod content_cache;
pub mod inference;
pub mod llm_service;
pub mod retry;

pub use checkpoint_store::{config_fingerprint, CheckpointStore, CheckpointValidation};
pub use concurrency_governor::{ConcurrencyGovernor, ConcurrencyState, GovernorConfig, SlotGuard};
pub use content_cache::{CacheStats, ContentCache};
pub use inference::{GroupEvaluator, ItemEvaluator};
pub use llm_service::LlmService;
pub use retry::{Backoff, RetryPolicy};
