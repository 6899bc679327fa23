//! 推送通道重连退避
//!
//! 指数退避：1s → 2s → 4s → 8s → 15s 封顶，每次叠加 ±jitter 抖动；
//! 尝试次数有上限，耗尽后连接状态进入 Failed。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 重连配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 单次订阅内最多重连次数
    pub max_attempts: u32,
    /// 初始重连间隔（毫秒）
    pub initial_interval_ms: u64,
    /// 最大重连间隔（毫秒）
    pub max_interval_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 抖动比例（0.0 ~ 1.0）
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 1_000,
            max_interval_ms: 15_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

/// 单个订阅的退避状态
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// 已经发起的重连次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }

    /// 登记一次重连并返回等待时间；次数耗尽返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        Some(self.with_jitter(base))
    }

    /// 连上后清零
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// 不含抖动的第 n 次（从 0 开始）间隔
    fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_interval_ms as f64;
        let max = self.config.max_interval_ms as f64;
        let millis = initial * self.config.backoff_multiplier.max(1.0).powi(attempt as i32);
        Duration::from_millis(millis.min(max) as u64)
    }

    fn with_jitter(&self, base: Duration) -> Duration {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-ratio..=ratio);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}
