//! 批量评估处理器 - 编排层
//!
//! ## 职责
//!
//! 驱动一批照片的评估，负责批次级别的状态与持久化：
//!
//! 1. **恢复**：读取并校验检查点，有效则跳过已完成的条目
//! 2. **去重**：输入中重复的条目 ID 只处理一次
//! 3. **并发**：每个待处理条目一个 tokio 任务（JoinSet），由并发调度器限流
//! 4. **检查点**：每完成 N 个条目合并保存一次，与完成顺序无关
//! 5. **收尾**：全部条目完成或失败后删除检查点，输出汇总
//!
//! 单个条目失败不会中断批次。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EvaluationParams};
use crate::error::AppResult;
use crate::infrastructure::MemoryProbe;
use crate::models::{BatchCheckpoint, EvaluationResult, PhotoItem, ScoredItem};
use crate::services::{
    CheckpointStore, ConcurrencyGovernor, ContentCache, GovernorConfig, ItemEvaluator,
    RetryPolicy,
};
use crate::workflow::{ItemCtx, ItemFlow, ItemOutcome};

/// 条目在本次运行中的状态
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    Pending,
    InFlight,
    Done,
    Failed { reason: String },
}

/// 推送给调用方的进度事件
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEvent {
    pub item_id: String,
    pub outcome: ItemOutcome,
}

/// 批次汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// 去重后的条目数
    pub total: usize,
    /// 成功条目数（含恢复和缓存命中）
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    /// 从检查点恢复、本次未重新处理的条目数
    pub restored: usize,
    /// 本次对推理服务的调用次数（含重试）
    pub invoked: u32,
}

/// 批次报告
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub results: BTreeMap<String, EvaluationResult>,
    /// 失败条目及最后一次错误
    pub failures: BTreeMap<String, String>,
}

impl BatchReport {
    /// 组合优化器的输入
    pub fn scored_items(&self) -> Vec<ScoredItem> {
        self.results
            .iter()
            .map(|(id, result)| ScoredItem::from_result(id.clone(), result))
            .collect()
    }
}

/// 待合并进检查点的增量
#[derive(Default)]
struct PendingProgress {
    completed: Vec<String>,
    results: BTreeMap<String, EvaluationResult>,
    failures: BTreeMap<String, String>,
    settled_since_save: usize,
}

impl PendingProgress {
    fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failures.is_empty()
    }

    fn merge_into(&mut self, checkpoint: BatchCheckpoint) -> BatchCheckpoint {
        let checkpoint = CheckpointStore::update(
            checkpoint,
            std::mem::take(&mut self.completed),
            std::mem::take(&mut self.results),
        );
        let checkpoint =
            CheckpointStore::record_failures(checkpoint, std::mem::take(&mut self.failures));
        self.settled_since_save = 0;
        checkpoint
    }
}

/// 批量评估编排器
pub struct BatchOrchestrator {
    project_id: String,
    params: EvaluationParams,
    checkpoint_interval: usize,
    store: CheckpointStore,
    cache: Option<Arc<ContentCache>>,
    evaluator: Arc<dyn ItemEvaluator>,
    retry: RetryPolicy,
    governor_config: GovernorConfig,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    events: Option<UnboundedSender<BatchEvent>>,
}

impl BatchOrchestrator {
    pub fn new(config: &Config, evaluator: Arc<dyn ItemEvaluator>) -> Self {
        let cache = config.cache.enabled.then(|| {
            Arc::new(ContentCache::new(
                config.cache_dir(),
                config.cache.warn_entry_count,
            ))
        });

        Self {
            project_id: config.project_id.clone(),
            params: config.evaluation.clone(),
            checkpoint_interval: config.checkpoint.interval.max(1),
            store: CheckpointStore::new(config.checkpoint_path(), config.checkpoint.staleness_days),
            cache,
            evaluator,
            retry: config.retry.clone(),
            governor_config: config.concurrency.clone(),
            memory_probe: None,
            events: None,
        }
    }

    /// 接收进度事件
    pub fn with_event_sink(mut self, sink: UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(sink);
        self
    }

    /// 启用内存采样
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ContentCache>> {
        self.cache.as_ref()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// 运行一个批次
    pub async fn run(&self, items: Vec<PhotoItem>) -> AppResult<BatchReport> {
        let items = dedupe(items);
        let total = items.len();
        let mut report = BatchReport {
            summary: BatchSummary {
                total,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut checkpoint = self.resume_or_initialize(&items).await;
        let mut states: BTreeMap<String, ItemState> = BTreeMap::new();

        for item in &items {
            let restored = checkpoint
                .progress
                .completed
                .contains(&item.id)
                .then(|| checkpoint.results.get(&item.id))
                .flatten();
            match restored {
                Some(result) => {
                    states.insert(item.id.clone(), ItemState::Done);
                    report.results.insert(item.id.clone(), result.clone());
                    report.summary.restored += 1;
                }
                None => {
                    states.insert(item.id.clone(), ItemState::Pending);
                }
            }
        }

        // 批次开始即落盘；之后的保存失败只告警
        self.store.save(&checkpoint).await?;

        let pending: Vec<PhotoItem> = items
            .into_iter()
            .filter(|item| states.get(&item.id) == Some(&ItemState::Pending))
            .collect();
        log_batch_start(&self.project_id, total, report.summary.restored, pending.len());

        let governor = match &self.memory_probe {
            Some(probe) => {
                ConcurrencyGovernor::with_memory_probe(self.governor_config.clone(), probe.clone())
            }
            None => ConcurrencyGovernor::new(self.governor_config.clone()),
        };
        // 限制同时存在的任务数，避免所有照片同时读入内存
        let spawn_window = governor.snapshot().max_slots * 2;

        let flow = Arc::new(ItemFlow::new(
            self.evaluator.clone(),
            self.cache.clone(),
            governor,
            self.retry.clone(),
            self.params.clone(),
        ));

        let pending_total = pending.len();
        let mut queue = pending.into_iter().enumerate();
        let mut join_set: JoinSet<(String, ItemOutcome)> = JoinSet::new();
        let mut progress = PendingProgress::default();

        loop {
            while join_set.len() < spawn_window {
                let Some((idx, item)) = queue.next() else {
                    break;
                };
                states.insert(item.id.clone(), ItemState::InFlight);
                let ctx = ItemCtx::new(&self.project_id, &item.id, idx + 1, pending_total);
                let flow = Arc::clone(&flow);
                join_set.spawn(async move {
                    let outcome = flow.run(&item, &ctx).await;
                    (item.id, outcome)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (item_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("❌ 条目任务异常退出: {}", e);
                    continue;
                }
            };

            self.record_outcome(&item_id, &outcome, &mut states, &mut report, &mut progress);
            self.emit(&item_id, outcome);

            if progress.settled_since_save >= self.checkpoint_interval {
                checkpoint = progress.merge_into(checkpoint);
                self.persist(&checkpoint).await;
            }
        }

        // 异常退出的任务没有结果，按失败处理
        for (item_id, state) in states.iter_mut() {
            if *state == ItemState::InFlight {
                let reason = "任务异常退出".to_string();
                report.failures.insert(item_id.clone(), reason.clone());
                report.summary.failed += 1;
                progress.failures.insert(item_id.clone(), reason.clone());
                *state = ItemState::Failed { reason };
            }
        }

        if !progress.is_empty() {
            checkpoint = progress.merge_into(checkpoint);
        }
        self.persist(&checkpoint).await;

        report.summary.succeeded = report.results.len();
        if checkpoint.all_settled() {
            self.store.delete().await?;
        } else {
            warn!(
                "⚠️ 批次未完全结束，检查点保留: {}",
                self.store.path().display()
            );
        }

        log_batch_complete(&report.summary);
        Ok(report)
    }

    /// 读取并校验检查点；无效则丢弃并从头开始
    async fn resume_or_initialize(&self, items: &[PhotoItem]) -> BatchCheckpoint {
        let ids = items.iter().map(|item| item.id.clone());

        let Some(existing) = self.store.load().await else {
            info!("📝 没有可用的检查点，开始新批次");
            return CheckpointStore::initialize(&self.project_id, &self.params, ids);
        };

        let validation = self.store.validate(&existing, &self.project_id, &self.params);
        if !validation.valid {
            warn!("⚠️ 丢弃检查点: {}", validation.reason);
            if let Err(e) = self.store.delete().await {
                warn!("删除旧检查点失败: {}", e);
            }
            return CheckpointStore::initialize(&self.project_id, &self.params, ids);
        }

        let mut checkpoint = CheckpointStore::mark_resumed(existing);
        // 条目集合以本次输入为准；已完成的条目保留，保证 completed ⊆ known
        let completed = checkpoint.progress.completed.clone();
        checkpoint.progress.known_items = ids.chain(completed).collect();

        info!(
            "♻️ 从检查点恢复: 已完成 {} 个，第 {} 次恢复",
            checkpoint.progress.completed.len(),
            checkpoint.metadata.resume_count
        );
        checkpoint
    }

    fn record_outcome(
        &self,
        item_id: &str,
        outcome: &ItemOutcome,
        states: &mut BTreeMap<String, ItemState>,
        report: &mut BatchReport,
        progress: &mut PendingProgress,
    ) {
        match outcome {
            ItemOutcome::CacheHit(result) => {
                report.summary.cache_hits += 1;
                self.record_success(item_id, result, states, report, progress);
            }
            ItemOutcome::Evaluated { result, attempts } => {
                report.summary.invoked += attempts;
                self.record_success(item_id, result, states, report, progress);
            }
            ItemOutcome::Failed { reason, attempts } => {
                report.summary.invoked += attempts;
                report.summary.failed += 1;
                report.failures.insert(item_id.to_string(), reason.clone());
                progress.failures.insert(item_id.to_string(), reason.clone());
                states.insert(
                    item_id.to_string(),
                    ItemState::Failed {
                        reason: reason.clone(),
                    },
                );
            }
        }
        progress.settled_since_save += 1;
    }

    fn record_success(
        &self,
        item_id: &str,
        result: &EvaluationResult,
        states: &mut BTreeMap<String, ItemState>,
        report: &mut BatchReport,
        progress: &mut PendingProgress,
    ) {
        report.results.insert(item_id.to_string(), result.clone());
        progress.completed.push(item_id.to_string());
        progress.results.insert(item_id.to_string(), result.clone());
        states.insert(item_id.to_string(), ItemState::Done);
    }

    fn emit(&self, item_id: &str, outcome: ItemOutcome) {
        if let Some(sink) = &self.events {
            let event = BatchEvent {
                item_id: item_id.to_string(),
                outcome,
            };
            if sink.send(event).is_err() {
                debug!("事件接收端已关闭");
            }
        }
    }

    async fn persist(&self, checkpoint: &BatchCheckpoint) {
        if let Err(e) = self.store.save(checkpoint).await {
            warn!("⚠️ 保存检查点失败，稍后重试: {}", e);
        }
    }
}

/// 按 ID 去重，保留首次出现的条目和顺序
fn dedupe(items: Vec<PhotoItem>) -> Vec<PhotoItem> {
    let before = items.len();
    let mut seen = HashSet::new();
    let unique: Vec<PhotoItem> = items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect();
    if unique.len() < before {
        warn!("⚠️ 输入中有 {} 个重复条目，已合并", before - unique.len());
    }
    unique
}

// ========== 日志辅助函数 ==========

fn log_batch_start(project_id: &str, total: usize, restored: usize, pending: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理项目 {}", project_id);
    info!(
        "📄 条目总数: {} (已恢复 {}, 待处理 {})",
        total, restored, pending
    );
    info!("{}", "=".repeat(60));
}

fn log_batch_complete(summary: &BatchSummary) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ 批次完成: 成功 {}/{} (缓存命中 {}, 恢复 {}), 失败 {}, 调用 {} 次",
        summary.succeeded,
        summary.total,
        summary.cache_hits,
        summary.restored,
        summary.failed,
        summary.invoked
    );
    info!("{}", "─".repeat(60));
}
