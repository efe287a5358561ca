//! # Photo Batch
//!
//! 可恢复、带缓存、自适应并发的照片批量评估引擎，以及基于评估结果的组合优化器
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 与业务无关的底层能力
//! - `write_atomic` - 同目录临时文件 + fsync + rename 的原子写入
//! - `fingerprint` - 键顺序无关的规范 JSON + SHA-256
//! - `ProcessMemoryProbe` - 进程内存采样
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心批次流程
//! - `CheckpointStore` - 检查点的读取、校验、合并与原子保存
//! - `ContentCache` - 按 (照片指纹, 参数指纹, 模型) 寻址的结果缓存
//! - `ConcurrencyGovernor` - 根据延迟与内存自动伸缩的执行槽位
//! - `RetryPolicy` - 所有外部调用共用的重试策略
//! - `LlmService` - OpenAI 兼容接口的单张 / 整组评估
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一张照片"的完整处理流程
//! - `ItemCtx` - 上下文封装（项目 + 条目序号）
//! - `ItemFlow` - 流程编排（缓存 → 槽位 → 调用 → 写缓存）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量评估，检查点恢复，并发调度
//! - `orchestrator/set_optimizer` - 组合优化
//! - `orchestrator/app` - 应用生命周期
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, EvaluationParams};
pub use error::{AppError, AppResult};
pub use models::{CandidateSet, EvaluationResult, PhotoItem, ScoredItem};
pub use orchestrator::{App, BatchOrchestrator, BatchReport, SetCombinationOptimizer};
pub use services::{GroupEvaluator, ItemEvaluator};
pub use workflow::{ItemCtx, ItemFlow, ItemOutcome};
