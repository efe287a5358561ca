//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 管理应用生命周期（初始化、运行、统计输出）
//! - 扫描照片目录，组装 LLM 服务
//!
//! ### `batch_processor` - 批量评估处理器
//! - 检查点恢复与保存
//! - 为每张照片创建 tokio 任务（JoinSet），交给并发调度器限流
//! - 汇总结果、推送进度事件
//!
//! ### `set_optimizer` - 组合优化器
//! - 在已评分照片中选出 K 张的最优组合
//!
//! ## 层次关系
//!
//! ```text
//! app
//!     ↓
//! batch_processor (处理 Vec<PhotoItem>)      set_optimizer (处理 Vec<ScoredItem>)
//!     ↓                                          ↓
//! workflow::ItemFlow (处理单张照片)          services::GroupEvaluator
//!     ↓
//! services (能力层：cache / checkpoint / governor / retry / llm)
//!     ↓
//! infrastructure (基础设施：原子写入、指纹、内存采样)
//! ```

pub mod app;
pub mod batch_processor;
pub mod set_optimizer;

// 重新导出主要类型
pub use app::App;
pub use batch_processor::{
    BatchEvent, BatchOrchestrator, BatchReport, BatchSummary, ItemState,
};
pub use set_optimizer::{binomial, OptimizerConfig, SetCombinationOptimizer};
