//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数

use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::CandidateSet;
use crate::orchestrator::BatchSummary;
use crate::services::CacheStats;

/// 初始化 tracing 输出
///
/// 优先使用 `RUST_LOG`；否则默认 info，verbose 时为 debug。重复调用不会报错。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n照片批量评估日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)
        .with_context(|| format!("无法创建日志文件: {}", log_file_path))?;
    Ok(())
}

/// 向日志文件追加一段文本
pub fn append_log_file(log_file_path: &str, text: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .with_context(|| format!("无法打开日志文件: {}", log_file_path))?;
    writeln!(file, "{}", text)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    let concurrency = match config.concurrency.fixed_slots {
        Some(fixed) => format!("固定 {}", fixed),
        None => format!(
            "自动 {}-{}",
            config.concurrency.initial_slots, config.concurrency.max_slots
        ),
    };
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 照片批量评估模式");
    info!("📁 项目: {} (照片目录: {})", config.project_id, config.photo_folder);
    info!(
        "🤖 模型: {} / 提示词版本 {}",
        config.evaluation.model_id, config.evaluation.prompt_version
    );
    info!("📊 并发: {}", concurrency);
    info!("{}", "=".repeat(60));
}

/// 记录照片加载信息
pub fn log_items_loaded(total: usize, checkpoint_interval: usize) {
    info!("✓ 找到 {} 张待评估的照片", total);
    info!("💾 每完成 {} 张保存一次检查点\n", checkpoint_interval);
}

/// 缓存增长提示：缓存不会自动淘汰
pub fn log_cache_stats(stats: &CacheStats, cache_dir: &str) {
    info!(
        "💾 缓存: {} 条, {:.1} MB, 本次命中率 {:.0}%",
        stats.entry_count,
        stats.bytes_on_disk as f64 / (1024.0 * 1024.0),
        stats.hit_rate * 100.0
    );
    if stats.over_warning_threshold {
        warn!(
            "⚠️ 缓存条目过多 ({} 条)，可设置 PHOTO_BATCH_CLEAR_CACHE=1 清理: {}",
            stats.entry_count, cache_dir
        );
    }
}

/// 输出排名靠前的组合
pub fn log_top_candidates(candidates: &[CandidateSet], limit: usize) {
    info!("\n{}", "─".repeat(60));
    info!("🏆 推荐组合 (前 {} 个)", limit.min(candidates.len()));
    for (rank, candidate) in candidates.iter().take(limit).enumerate() {
        let group = match candidate.group_score {
            Some(score) => format!("{:.1}", score),
            None => "无".to_string(),
        };
        info!(
            "  {}. {} | 综合 {:.2} | 质量和 {:.1} | 多样性 {:.2} | 整体 {}",
            rank + 1,
            candidate.item_ids.join(", "),
            candidate.composite_score,
            candidate.quality_sum,
            candidate.diversity_bonus,
            group
        );
    }
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息，同时写入日志文件
pub fn print_final_stats(summary: &BatchSummary, log_file_path: &str) {
    let finished_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!("完成时间: {}", finished_at);
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", summary.succeeded, summary.total);
    info!("💾 缓存命中: {}", summary.cache_hits);
    info!("♻️ 检查点恢复: {}", summary.restored);
    info!("🤖 推理调用: {} 次", summary.invoked);
    info!("❌ 失败: {}", summary.failed);
    info!("{}", "=".repeat(60));

    let record = format!(
        "完成时间: {}\n成功: {}/{}\n缓存命中: {}\n检查点恢复: {}\n推理调用: {}\n失败: {}\n",
        finished_at,
        summary.succeeded,
        summary.total,
        summary.cache_hits,
        summary.restored,
        summary.invoked,
        summary.failed
    );
    match append_log_file(log_file_path, &record) {
        Ok(()) => info!("\n日志已保存至: {}", log_file_path),
        Err(e) => warn!("写入日志文件失败: {:#}", e),
    }
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
        assert_eq!(truncate_text("一二三四五", 3), "一二三...");
    }

    #[test]
    fn test_log_file_header_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let path = path.to_str().unwrap();

        init_log_file(path).unwrap();
        append_log_file(path, "成功: 3/3").unwrap();

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("照片批量评估日志"));
        assert!(content.ends_with("成功: 3/3\n"));
    }
}
