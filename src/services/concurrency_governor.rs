//! 并发调度器 - 业务能力层
//!
//! 管理一组有限的执行槽位，并根据延迟与内存反馈自动伸缩：
//! - 前若干次延迟样本的均值作为基线
//! - 最近窗口均值 < 基线 × 1.2 且未达上限 → 槽位 +1
//! - 最近窗口均值 > 基线 × 2.0 → 槽位 -1（最少 1）
//! - 进程内存超过阈值 → 强制降为 1，直到内存回落
//!
//! 显式指定 `fixed_slots` 时不做任何自动伸缩。
//! 槽位通过 [`SlotGuard`] 持有，drop 时自动归还，错误路径也不会漏还。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::MemoryProbe;

/// 并发配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// 槽位上限
    pub max_slots: usize,
    /// 固定槽位数，设置后覆盖自动伸缩
    pub fixed_slots: Option<usize>,
    /// 自动伸缩的起始槽位数
    pub initial_slots: usize,
    /// 建立基线所需的样本数
    pub baseline_samples: usize,
    /// 滚动窗口大小
    pub window: usize,
    pub scale_up_ratio: f64,
    pub scale_down_ratio: f64,
    /// 内存阈值（字节），None 表示不检查
    pub memory_threshold_bytes: Option<u64>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            fixed_slots: None,
            initial_slots: 2,
            baseline_samples: 3,
            window: 5,
            scale_up_ratio: 1.2,
            scale_down_ratio: 2.0,
            memory_threshold_bytes: None,
        }
    }
}

impl GovernorConfig {
    /// 固定槽位数的配置
    pub fn fixed(slots: usize) -> Self {
        Self {
            max_slots: slots,
            fixed_slots: Some(slots),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_slots == 0 {
            return Err(AppError::invalid_config("concurrency.max_slots", "至少为 1"));
        }
        if self.fixed_slots == Some(0) {
            return Err(AppError::invalid_config("concurrency.fixed_slots", "至少为 1"));
        }
        if self.baseline_samples == 0 || self.window == 0 {
            return Err(AppError::invalid_config(
                "concurrency.window",
                "基线样本数和窗口大小至少为 1",
            ));
        }
        if !(self.scale_up_ratio > 0.0 && self.scale_up_ratio < self.scale_down_ratio) {
            return Err(AppError::invalid_config(
                "concurrency.scale_up_ratio",
                "需要 0 < scale_up_ratio < scale_down_ratio",
            ));
        }
        Ok(())
    }

    /// 实际生效的上限：固定值优先
    fn effective_max(&self) -> usize {
        self.fixed_slots.unwrap_or(self.max_slots).max(1)
    }

    fn starting_limit(&self) -> usize {
        match self.fixed_slots {
            Some(fixed) => fixed.max(1),
            None => self.initial_slots.clamp(1, self.effective_max()),
        }
    }
}

/// 并发状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyState {
    pub max_slots: usize,
    /// 当前允许的槽位数
    pub limit: usize,
    /// 正在使用的槽位数
    pub active: usize,
    pub baseline_ms: Option<f64>,
    pub recent_latencies_ms: Vec<f64>,
    pub last_memory_bytes: Option<u64>,
    pub memory_pressure: bool,
}

#[derive(Debug)]
struct GovernorState {
    limit: usize,
    active: usize,
    baseline_buf: Vec<f64>,
    baseline_ms: Option<f64>,
    recent: VecDeque<f64>,
    last_memory_bytes: Option<u64>,
    memory_pressure: bool,
}

struct Inner {
    config: GovernorConfig,
    max_slots: usize,
    state: Mutex<GovernorState>,
    notify: Notify,
    probe: Option<Arc<dyn MemoryProbe>>,
    next_slot_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        // 临界区内不会 panic；即使中毒，状态也仍然一致
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release_slot(&self, slot_id: u64) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            debug!(
                "归还槽位 #{} (使用中 {}/{})",
                slot_id, state.active, state.limit
            );
        }
        self.notify.notify_waiters();
    }
}

/// 已获取的槽位
///
/// drop 时归还槽位，保证每次成功的 `acquire` 恰好对应一次归还。
pub struct SlotGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl SlotGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard").field("id", &self.id).finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release_slot(self.id);
    }
}

/// 并发调度器
#[derive(Clone)]
pub struct ConcurrencyGovernor {
    inner: Arc<Inner>,
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self::build(config, None)
    }

    /// 带内存采样的调度器
    pub fn with_memory_probe(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::build(config, Some(probe))
    }

    fn build(config: GovernorConfig, probe: Option<Arc<dyn MemoryProbe>>) -> Self {
        let max_slots = config.effective_max();
        let state = GovernorState {
            limit: config.starting_limit(),
            active: 0,
            baseline_buf: Vec::new(),
            baseline_ms: None,
            recent: VecDeque::new(),
            last_memory_bytes: None,
            memory_pressure: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                max_slots,
                state: Mutex::new(state),
                notify: Notify::new(),
                probe,
                next_slot_id: AtomicU64::new(1),
            }),
        }
    }

    /// 获取一个槽位；没有空闲槽位时挂起等待（不忙等）
    pub async fn acquire(&self) -> SlotGuard {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记等待，再检查状态，避免错过检查与等待之间的唤醒
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            notified.await;
        }
    }

    /// 非阻塞获取
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let mut state = self.inner.lock();
        if state.active >= state.limit {
            return None;
        }
        state.active += 1;
        let id = self.inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
        debug!("获取槽位 #{} (使用中 {}/{})", id, state.active, state.limit);
        Some(SlotGuard {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// 显式归还槽位
    pub fn release(&self, slot: SlotGuard) {
        drop(slot);
    }

    /// 上报一次调用延迟，驱动自动伸缩
    pub fn report_latency(&self, slot: &SlotGuard, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        let mut grew = false;

        if self.check_memory(&mut state) {
            return;
        }

        if config.fixed_slots.is_some() {
            push_window(&mut state.recent, latency_ms, config.window);
            return;
        }

        let Some(baseline) = state.baseline_ms else {
            state.baseline_buf.push(latency_ms);
            if state.baseline_buf.len() >= config.baseline_samples {
                let baseline = mean(&state.baseline_buf);
                state.baseline_ms = Some(baseline);
                state.baseline_buf.clear();
                info!("📏 延迟基线已建立: {:.0} ms", baseline);
            }
            return;
        };

        push_window(&mut state.recent, latency_ms, config.window);
        if state.recent.len() < config.window {
            return;
        }

        let avg = mean_deque(&state.recent);
        if avg > baseline * config.scale_down_ratio && state.limit > 1 {
            state.limit -= 1;
            state.recent.clear();
            warn!(
                "🐢 延迟升高 ({:.0} ms > 基线 {:.0} ms × {}), 并发降为 {} (槽位 #{})",
                avg, baseline, config.scale_down_ratio, state.limit, slot.id
            );
        } else if avg < baseline * config.scale_up_ratio && state.limit < self.inner.max_slots {
            state.limit += 1;
            state.recent.clear();
            grew = true;
            info!(
                "🚀 延迟稳定 ({:.0} ms), 并发升为 {}/{}",
                avg, state.limit, self.inner.max_slots
            );
        }

        drop(state);
        if grew {
            self.inner.notify.notify_waiters();
        }
    }

    /// 采样内存；处于内存压力时返回 true（本次不再做延迟判断）
    fn check_memory(&self, state: &mut GovernorState) -> bool {
        let (Some(probe), Some(threshold)) = (
            self.inner.probe.as_ref(),
            self.inner.config.memory_threshold_bytes,
        ) else {
            return false;
        };
        if self.inner.config.fixed_slots.is_some() {
            return false;
        }

        let sample = probe.resident_bytes();
        state.last_memory_bytes = sample;
        let over = sample.map(|bytes| bytes > threshold).unwrap_or(false);

        if over {
            if !state.memory_pressure {
                warn!(
                    "⚠️ 内存 {} 字节超过阈值 {} 字节，并发强制降为 1",
                    sample.unwrap_or_default(),
                    threshold
                );
            }
            state.memory_pressure = true;
            state.limit = 1;
            state.recent.clear();
            return true;
        }

        if state.memory_pressure {
            state.memory_pressure = false;
            info!("✓ 内存已回落到阈值以下，恢复自动伸缩");
        }
        false
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> ConcurrencyState {
        let state = self.inner.lock();
        ConcurrencyState {
            max_slots: self.inner.max_slots,
            limit: state.limit,
            active: state.active,
            baseline_ms: state.baseline_ms,
            recent_latencies_ms: state.recent.iter().copied().collect(),
            last_memory_bytes: state.last_memory_bytes,
            memory_pressure: state.memory_pressure,
        }
    }
}

fn push_window(window: &mut VecDeque<f64>, value: f64, size: usize) {
    window.push_back(value);
    while window.len() > size.max(1) {
        window.pop_front();
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_deque(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_pending, assert_ready, task};

    fn auto_config(initial: usize, max: usize) -> GovernorConfig {
        GovernorConfig {
            max_slots: max,
            fixed_slots: None,
            initial_slots: initial,
            baseline_samples: 2,
            window: 2,
            ..Default::default()
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    struct FakeProbe(AtomicU64);

    impl MemoryProbe for FakeProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_acquire_suspends_until_release() {
        let governor = ConcurrencyGovernor::new(GovernorConfig::fixed(1));
        let first = governor.try_acquire().expect("first slot");

        let mut waiting = task::spawn(governor.acquire());
        assert_pending!(waiting.poll());

        governor.release(first);
        assert!(waiting.is_woken());
        let second = assert_ready!(waiting.poll());
        assert_eq!(governor.snapshot().active, 1);
        assert_eq!(format!("{:?}", second), format!("SlotGuard {{ id: {} }}", second.id()));
        drop(second);
        assert_eq!(governor.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let governor = ConcurrencyGovernor::new(GovernorConfig::fixed(3));
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let governor = governor.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let slot = governor.acquire().await;
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(governor.snapshot().active <= 3);
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                governor.release(slot);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(governor.snapshot().active, 0);
    }

    #[test]
    fn test_scales_up_on_stable_latency() {
        let governor = ConcurrencyGovernor::new(auto_config(1, 3));
        let slot = governor.try_acquire().unwrap();

        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        assert_eq!(governor.snapshot().baseline_ms, Some(100.0));
        assert_eq!(governor.snapshot().limit, 1);

        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(110));
        assert_eq!(governor.snapshot().limit, 2);

        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        // 不超过上限
        assert_eq!(governor.snapshot().limit, 3);
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        assert_eq!(governor.snapshot().limit, 3);
    }

    #[test]
    fn test_scales_down_on_slow_latency_but_not_below_one() {
        let governor = ConcurrencyGovernor::new(auto_config(2, 4));
        let slot = governor.try_acquire().unwrap();

        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(300));
        governor.report_latency(&slot, ms(300));
        assert_eq!(governor.snapshot().limit, 1);

        governor.report_latency(&slot, ms(500));
        governor.report_latency(&slot, ms(500));
        assert_eq!(governor.snapshot().limit, 1);
    }

    #[test]
    fn test_middle_band_keeps_limit() {
        let governor = ConcurrencyGovernor::new(auto_config(2, 4));
        let slot = governor.try_acquire().unwrap();
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(100));
        governor.report_latency(&slot, ms(150));
        governor.report_latency(&slot, ms(150));
        assert_eq!(governor.snapshot().limit, 2);
    }

    #[test]
    fn test_memory_pressure_forces_single_slot() {
        let probe = Arc::new(FakeProbe(AtomicU64::new(500)));
        let config = GovernorConfig {
            memory_threshold_bytes: Some(1_000),
            ..auto_config(3, 4)
        };
        let governor = ConcurrencyGovernor::with_memory_probe(config, probe.clone());
        let slot = governor.try_acquire().unwrap();

        governor.report_latency(&slot, ms(100));
        assert_eq!(governor.snapshot().limit, 3);

        probe.0.store(2_000, Ordering::SeqCst);
        governor.report_latency(&slot, ms(100));
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.limit, 1);
        assert!(snapshot.memory_pressure);
        assert_eq!(snapshot.last_memory_bytes, Some(2_000));

        probe.0.store(100, Ordering::SeqCst);
        governor.report_latency(&slot, ms(100));
        assert!(!governor.snapshot().memory_pressure);
    }

    #[test]
    fn test_fixed_slots_override_auto_scaling() {
        let governor = ConcurrencyGovernor::new(GovernorConfig::fixed(2));
        let slot = governor.try_acquire().unwrap();
        for _ in 0..10 {
            governor.report_latency(&slot, ms(10));
        }
        for _ in 0..10 {
            governor.report_latency(&slot, ms(10_000));
        }
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.limit, 2);
        assert_eq!(snapshot.max_slots, 2);
        assert!(snapshot.baseline_ms.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(GovernorConfig::default().validate().is_ok());
        assert!(GovernorConfig {
            max_slots: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(GovernorConfig {
            scale_up_ratio: 3.0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
