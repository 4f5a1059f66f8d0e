//! 限流调度模块 - 解析额度重置时间并计算等待时长

use chrono::{NaiveTime, Timelike};
use regex::Regex;
use std::fmt;
use std::time::Duration;

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// AM/PM 标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "am" | "a.m." | "a" => Some(Meridiem::Am),
            "pm" | "p.m." | "p" => Some(Meridiem::Pm),
            _ => None,
        }
    }
}

impl fmt::Display for Meridiem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Meridiem::Am => write!(f, "am"),
            Meridiem::Pm => write!(f, "pm"),
        }
    }
}

/// 从限流提示中解析出的重置时间
///
/// 每次检测到限流提示时重新计算，不做缓存。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDeadline {
    /// 原始捕获的小时（12 小时制 1-12，或无标记时的 24 小时制 0-23）
    pub hour: u32,
    pub meridiem: Option<Meridiem>,
}

impl RateLimitDeadline {
    /// 校验并构造；超出范围的小时视为无法解析
    pub fn new(hour: u32, meridiem: Option<Meridiem>) -> Option<Self> {
        let valid = match meridiem {
            Some(_) => (1..=12).contains(&hour),
            None => hour <= 23,
        };
        valid.then_some(Self { hour, meridiem })
    }

    /// 转换为 24 小时制：12 PM 保持 12，12 AM 变为 0
    pub fn hour_24(&self) -> u32 {
        match (self.meridiem, self.hour) {
            (Some(Meridiem::Pm), 12) => 12,
            (Some(Meridiem::Pm), h) => h + 12,
            (Some(Meridiem::Am), 12) => 0,
            (_, h) => h,
        }
    }

    /// 计算从 `now` 到目标整点的等待时长，目标已过则顺延到第二天
    pub fn wait_from(&self, now: NaiveTime) -> Duration {
        let target = i64::from(self.hour_24()) * 3600;
        let current = i64::from(now.num_seconds_from_midnight());
        let mut wait = target - current;
        if wait < 0 {
            wait += SECONDS_PER_DAY;
        }
        Duration::from_secs(wait as u64)
    }
}

impl fmt::Display for RateLimitDeadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00", self.hour_24())
    }
}

/// 限流提示检测器，持有配置中的正则（两个捕获组：小时、AM/PM）
#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    pattern: Regex,
}

impl RateLimitDetector {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    /// 在文本中查找限流提示；匹配但小时无法解析时返回 None
    pub fn detect(&self, text: &str) -> Option<RateLimitDeadline> {
        let caps = self.pattern.captures(text)?;
        let hour = caps.get(1)?.as_str().trim().parse::<u32>().ok()?;
        let meridiem = caps.get(2).and_then(|m| Meridiem::parse(m.as_str()));
        RateLimitDeadline::new(hour, meridiem)
    }
}

/// 把时长格式化为 "3h 05m"
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
}
