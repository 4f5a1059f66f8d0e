//! 终止信号 - SIGINT / SIGTERM 翻转共享标志
//!
//! 主循环和限流等待都会轮询这些标志，信号到达后走与正常停止相同的清理路径。

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 限流等待时检查标志的间隔
const PAUSE_SLICE: Duration = Duration::from_millis(250);

/// 停止请求
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    interrupted: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 SIGINT / SIGTERM 处理
    #[cfg(unix)]
    pub fn install(&self) -> Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;

        flag::register(SIGINT, Arc::clone(&self.interrupted)).context("注册 SIGINT 处理失败")?;
        flag::register(SIGTERM, Arc::clone(&self.terminated)).context("注册 SIGTERM 处理失败")?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install(&self) -> Result<()> {
        use signal_hook::consts::signal::SIGINT;
        use signal_hook::flag;

        flag::register(SIGINT, Arc::clone(&self.interrupted)).context("注册 SIGINT 处理失败")?;
        Ok(())
    }

    pub fn requested(&self) -> bool {
        self.interrupted() || self.terminated.load(Ordering::SeqCst)
    }

    /// 是否由用户中断（Ctrl+C）
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn request_terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// 长时间挂起（限流等待）
pub trait Pause {
    /// 等待 `duration`；被停止请求打断时返回 false
    fn pause(&mut self, duration: Duration, shutdown: &ShutdownFlag) -> bool;
}

/// 真实睡眠，按小片段检查停止标志
#[derive(Debug, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&mut self, duration: Duration, shutdown: &ShutdownFlag) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flag = ShutdownFlag::new();
        assert!(!flag.requested());

        let clone = flag.clone();
        clone.request_terminate();
        assert!(flag.requested());
        assert!(!flag.interrupted());

        flag.request_interrupt();
        assert!(clone.interrupted());
    }

    #[test]
    fn test_pause_completes() {
        let flag = ShutdownFlag::new();
        let start = Instant::now();
        assert!(ThreadPause.pause(Duration::from_millis(30), &flag));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pause_interrupted() {
        let flag = ShutdownFlag::new();
        let remote = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.request_terminate();
        });

        let start = Instant::now();
        assert!(!ThreadPause.pause(Duration::from_secs(30), &flag));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
