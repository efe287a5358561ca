//! 应用入口 - 编排层
//!
//! 管理应用生命周期：初始化 → 批量评估 → 组合优化（可选）→ 统计输出

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::ProcessMemoryProbe;
use crate::models::{load_photo_items, PhotoItem};
use crate::orchestrator::batch_processor::{BatchEvent, BatchOrchestrator, BatchReport};
use crate::orchestrator::set_optimizer::SetCombinationOptimizer;
use crate::services::{ContentCache, LlmService};
use crate::utils::logging::{
    init_log_file, log_cache_stats, log_items_loaded, log_startup, log_top_candidates,
    print_final_stats,
};

/// 设置后启动时清空当前项目的缓存
const CLEAR_CACHE_ENV: &str = "PHOTO_BATCH_CLEAR_CACHE";

/// 应用主结构
pub struct App {
    config: Config,
    llm: Arc<LlmService>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        init_log_file(&config.output_log_file)?;

        log_startup(&config);

        let project_dir = config.project_dir();
        tokio::fs::create_dir_all(&project_dir)
            .await
            .with_context(|| format!("无法创建状态目录: {}", project_dir.display()))?;

        if clear_cache_requested() {
            let cache = ContentCache::new(config.cache_dir(), config.cache.warn_entry_count);
            let removed = cache.clear().await.context("清理缓存失败")?;
            info!("🗑️ 已清理 {} 条缓存", removed);
        }

        let llm = Arc::new(LlmService::new(&config));

        Ok(Self { config, llm })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        info!("\n📁 正在扫描待评估的照片...");
        let items = load_photo_items(&self.config.photo_folder).await?;

        if items.is_empty() {
            warn!("⚠️ 没有找到待评估的照片，程序结束");
            return Ok(());
        }

        log_items_loaded(items.len(), self.config.checkpoint.interval);

        let report = self.run_batch(items.clone()).await?;

        print_final_stats(&report.summary, &self.config.output_log_file);

        if self.config.optimizer.enabled {
            self.run_optimizer(&report, &items).await;
        }

        Ok(())
    }

    async fn run_batch(&self, items: Vec<PhotoItem>) -> Result<BatchReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = tokio::spawn(report_progress(rx, items.len()));

        let orchestrator = BatchOrchestrator::new(&self.config, self.llm.clone())
            .with_event_sink(tx)
            .with_memory_probe(Arc::new(ProcessMemoryProbe));

        let report = orchestrator.run(items).await.context("批次处理失败")?;

        if let Some(cache) = orchestrator.cache() {
            match cache.stats().await {
                Ok(stats) => log_cache_stats(&stats, &cache.dir().display().to_string()),
                Err(e) => warn!("读取缓存统计失败: {}", e),
            }
        }

        // 关闭事件通道，进度任务随之结束
        drop(orchestrator);
        if let Err(e) = progress.await {
            warn!("进度任务异常退出: {}", e);
        }

        Ok(report)
    }

    /// 组合优化；失败只影响本次优化
    async fn run_optimizer(&self, report: &BatchReport, items: &[PhotoItem]) {
        let k = self.config.optimizer.subset_size;
        if report.results.len() < k {
            warn!(
                "⚠️ 成功评估的照片只有 {} 张，不足 {} 张，跳过组合优化",
                report.results.len(),
                k
            );
            return;
        }

        let photos: HashMap<String, PhotoItem> = items
            .iter()
            .map(|item| (item.id.clone(), item.clone()))
            .collect();
        let optimizer = SetCombinationOptimizer::new(
            self.config.optimizer.clone(),
            self.llm.clone(),
            self.config.retry.clone(),
            self.config.evaluation.clone(),
        );

        match optimizer.optimize(&report.scored_items(), &photos).await {
            Ok(ranked) => log_top_candidates(&ranked, self.config.optimizer.group_top_p),
            Err(e) => error!("❌ 组合优化失败: {}", e),
        }
    }
}

fn clear_cache_requested() -> bool {
    std::env::var(CLEAR_CACHE_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// 消费进度事件，输出完成进度
async fn report_progress(mut rx: mpsc::UnboundedReceiver<BatchEvent>, total: usize) {
    let mut done = 0;
    while let Some(event) = rx.recv().await {
        done += 1;
        let mark = if event.outcome.is_success() { "✓" } else { "✗" };
        info!("📈 进度 {}/{} {} {}", done, total, mark, event.item_id);
    }
}
