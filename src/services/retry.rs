//! 重试策略 - 业务能力层
//!
//! 所有外部调用共用同一个 [`RetryPolicy`] 值，不在调用点各写一套重试循环。

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::error::InferenceError;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// 退避策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// 固定间隔
    Fixed { delay_ms: u64 },
    /// 指数退避，间隔翻倍直到上限
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial_ms: 500,
                max_ms: 8_000,
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// 第 `failed_attempts` 次失败之后的等待时间
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let exp = failed_attempts.saturating_sub(1).min(32);
                let delay = initial_ms.saturating_mul(1_u64 << exp);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }

    /// 按策略执行异步操作
    ///
    /// `op` 接收当前尝试序号（从 1 开始）。不可重试的错误立即返回；
    /// 次数用尽后返回最后一次的错误。
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, InferenceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    warn!("{} 不可重试的错误: {}", label, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("{} 失败，已尝试 {} 次: {}", label, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} 调用失败 (尝试 {}/{}), {:?} 后重试: {}",
                        label, attempt, max_attempts, delay, e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Fixed { delay_ms: 1 })
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::new(
            10,
            Backoff::Exponential {
                initial_ms: 100,
                max_ms: 1_000,
            },
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(InferenceError::RateLimited {
                            model: "m".to_string(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InferenceError::api_failed("m", "boom")) }
            })
            .await;
        assert!(matches!(result, Err(InferenceError::ApiCallFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InferenceError::RequestBuildFailed("bad".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
