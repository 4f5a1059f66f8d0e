//! Session Driver - 监管单个 agent 会话的状态机
//!
//! 状态：
//! - `Starting`：启动新会话，注入下一阶段的 prompt
//! - `Running`：读取输出、分类写日志、自动批准权限、检测空闲
//! - `AwaitingRateLimitWait`：等待额度重置后用下一阶段重新启动
//! - `Stopped`：终态，会话已终止、日志已 flush
//!
//! 主循环是单线程的：带超时读取 → 分类 / 状态转换 → 空闲检查。
//! 只有限流等待会长时间挂起，且可被停止信号打断。

use crate::classifier::{LineBuffer, OutputClassifier, OutputEvent};
use crate::config::{Config, PhasePrompts};
use crate::filtered_log::FilteredLog;
use crate::phase::{Phase, PhaseCycler};
use crate::pty::{AgentSession, ReadOutcome, SessionLauncher};
use crate::rate_limit::{format_wait, RateLimitDeadline};
use crate::sanitizer::{visible_len, StreamSanitizer, Utf8Decoder};
use crate::signals::{Pause, ShutdownFlag, ThreadPause};
use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveTime};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 清洗后超过此字符数的输出才算 "有实质内容"
pub const MIN_SIGNAL_CHARS: usize = 5;

/// 未过滤缓冲区上限，超出后丢弃最旧的内容
pub const PENDING_CAP_BYTES: usize = 16 * 1024;

/// 停止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 子进程正常结束（没有限流提示）
    SessionExited,
    /// 达到最大续接次数
    IterationLimit,
    /// SIGINT
    Interrupted,
    /// SIGTERM
    Terminated,
    /// 读写子进程等不可恢复的错误
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::SessionExited => write!(f, "会话已结束"),
            StopReason::IterationLimit => write!(f, "达到最大续接次数"),
            StopReason::Interrupted => write!(f, "用户中断"),
            StopReason::Terminated => write!(f, "收到终止信号"),
            StopReason::Failed(msg) => write!(f, "运行失败: {}", msg),
        }
    }
}

/// 驱动器状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    Running { idle_since: Instant },
    AwaitingRateLimitWait(RateLimitDeadline),
    Stopped(StopReason),
}

/// 驱动器运行参数
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub idle_timeout: Duration,
    /// None 表示不限；只限制续接次数，不包括首次 prompt
    pub max_iterations: Option<u32>,
    pub quota_wait: bool,
    pub read_timeout: Duration,
    pub approval_response: String,
    /// 启动后等待 CLI 就绪的时间
    pub startup_delay: Duration,
    /// 输入 prompt 文本和回车之间的间隔
    pub submit_delay: Duration,
    pub min_signal_chars: usize,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            max_iterations: config.max_iterations,
            quota_wait: config.quota_wait,
            read_timeout: config.read_timeout,
            approval_response: config.approval_response.clone(),
            startup_delay: config.startup_delay,
            submit_delay: config.submit_delay,
            min_signal_chars: MIN_SIGNAL_CHARS,
        }
    }
}

/// 会话驱动器
pub struct SessionDriver {
    settings: DriverSettings,
    launcher: Box<dyn SessionLauncher>,
    cycler: PhaseCycler,
    prompts: PhasePrompts,
    classifier: OutputClassifier,
    log: FilteredLog,
    shutdown: ShutdownFlag,
    pause: Box<dyn Pause>,
    clock: Box<dyn Fn() -> NaiveTime>,

    state: DriverState,
    session: Option<Box<dyn AgentSession>>,
    decoder: Utf8Decoder,
    sanitizer: StreamSanitizer,
    lines: LineBuffer,
    /// 自上次批准 / 新会话以来的未过滤清洗文本
    pending: String,
    iterations: u32,
    started_at: Instant,
}

impl SessionDriver {
    pub fn new(
        settings: DriverSettings,
        launcher: Box<dyn SessionLauncher>,
        cycler: PhaseCycler,
        prompts: PhasePrompts,
        classifier: OutputClassifier,
        log: FilteredLog,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            settings,
            launcher,
            cycler,
            prompts,
            classifier,
            log,
            shutdown,
            pause: Box::new(ThreadPause),
            clock: Box::new(|| Local::now().time()),
            state: DriverState::Starting,
            session: None,
            decoder: Utf8Decoder::new(),
            sanitizer: StreamSanitizer::new(),
            lines: LineBuffer::new(),
            pending: String::new(),
            iterations: 0,
            started_at: Instant::now(),
        }
    }

    /// 替换限流等待的实现
    pub fn with_pause(mut self, pause: Box<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    /// 替换 "当前时刻" 的来源
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveTime + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// 已完成的续接次数
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 运行到停止，总会执行清理
    pub fn run(&mut self) -> StopReason {
        self.started_at = Instant::now();

        let reason = loop {
            match self.step() {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(e) => {
                    error!(error = ?e, "Session driver failed");
                    self.log.note(&format!("Error: {:#}", e));
                    break StopReason::Failed(format!("{:#}", e));
                }
            }
        };

        self.state = DriverState::Stopped(reason.clone());
        self.cleanup();
        info!(reason = ?reason, iterations = self.iterations, "Session driver stopped");
        reason
    }

    /// 执行一步状态转换，返回 Some 表示已停止
    fn step(&mut self) -> Result<Option<StopReason>> {
        if let Some(reason) = self.shutdown_reason() {
            return Ok(Some(reason));
        }

        match self.state.clone() {
            DriverState::Starting => self.start_session(),
            DriverState::Running { idle_since } => self.poll(idle_since),
            DriverState::AwaitingRateLimitWait(deadline) => self.wait_for_quota(deadline),
            DriverState::Stopped(reason) => Ok(Some(reason)),
        }
    }

    fn shutdown_reason(&self) -> Option<StopReason> {
        if self.shutdown.interrupted() {
            Some(StopReason::Interrupted)
        } else if self.shutdown.requested() {
            Some(StopReason::Terminated)
        } else {
            None
        }
    }

    /// 启动新会话并注入下一阶段的 prompt；等待期间收到停止信号则不发送
    fn start_session(&mut self) -> Result<Option<StopReason>> {
        self.end_session();

        let session = self.launcher.launch().context("启动 agent 会话失败")?;
        debug!(pid = ?session.pid(), "Session started");
        self.session = Some(session);

        if !self.settle(self.settings.startup_delay) {
            return Ok(Some(self.stop_for_shutdown()));
        }

        let phase = self.cycler.peek_next()?;
        if !self.send_prompt(phase)? {
            return Ok(Some(self.stop_for_shutdown()));
        }

        self.state = DriverState::Running {
            idle_since: Instant::now(),
        };
        Ok(None)
    }

    /// 可被停止信号打断的短等待
    fn settle(&mut self, delay: Duration) -> bool {
        delay.is_zero() || self.pause.pause(delay, &self.shutdown)
    }

    fn stop_for_shutdown(&self) -> StopReason {
        self.shutdown_reason().unwrap_or(StopReason::Interrupted)
    }

    /// 输入 prompt 文本，间隔后回车；发送成功后才持久化阶段
    ///
    /// 回车前被打断时返回 false，阶段不变。
    fn send_prompt(&mut self, phase: Phase) -> Result<bool> {
        let prompt = self.prompts.get(phase).clone();

        self.session_mut()?.write_text(&prompt.text)?;
        if !self.settle(self.settings.submit_delay) {
            info!(phase = %phase, "Prompt aborted before submit");
            return Ok(false);
        }
        self.session_mut()?.write_text("\r")?;

        self.cycler.commit(phase)?;

        info!(phase = %phase, name = %prompt.name, "Prompt sent");
        let model = if prompt.model_preference.is_empty() {
            String::new()
        } else {
            format!(" (model: {})", prompt.model_preference)
        };
        self.log
            .note(&format!("Phase {}: {}{}", phase, prompt.name, model));
        Ok(true)
    }

    /// Running 状态下的一次读取
    fn poll(&mut self, idle_since: Instant) -> Result<Option<StopReason>> {
        let timeout = self.settings.read_timeout;
        let outcome = self.session_mut()?.read_chunk(timeout)?;

        match outcome {
            ReadOutcome::Data(bytes) => {
                let text = self.decoder.decode(&bytes);
                let clean = self.sanitizer.push(&text);
                self.handle_clean(&clean)?;
            }
            ReadOutcome::Timeout => {}
            ReadOutcome::Eof => {
                let tail = self.decoder.finish();
                let mut clean = self.sanitizer.push(&tail);
                clean.push_str(&self.sanitizer.finish());
                self.handle_clean(&clean)?;
                if let Some(line) = self.lines.flush() {
                    self.record_line(&line);
                }
                return Ok(self.on_session_end());
            }
        }

        // 读到实质内容时 state 已被重置
        let idle_since = match self.state {
            DriverState::Running { idle_since } => idle_since,
            _ => idle_since,
        };
        if idle_since.elapsed() >= self.settings.idle_timeout {
            return self.on_idle(idle_since.elapsed());
        }
        Ok(None)
    }

    /// 处理一块已清洗的文本
    fn handle_clean(&mut self, clean: &str) -> Result<()> {
        if clean.is_empty() {
            return Ok(());
        }

        for line in self.lines.push(clean) {
            self.record_line(&line);
        }

        if visible_len(clean) <= self.settings.min_signal_chars {
            return Ok(());
        }

        self.state = DriverState::Running {
            idle_since: Instant::now(),
        };
        self.append_pending(clean);

        let matched = self
            .classifier
            .detect_permission(&self.pending)
            .map(str::to_string);
        if let Some(pattern) = matched {
            self.approve(&pattern)?;
        }
        Ok(())
    }

    fn record_line(&mut self, line: &str) {
        match self.classifier.classify(line) {
            OutputEvent::Noise => {}
            OutputEvent::Meaningful(text) => self.log.entry(&text),
            OutputEvent::PermissionRequest { .. } | OutputEvent::RateLimitNotice(_) => {
                self.log.entry(line.trim())
            }
        }
    }

    fn append_pending(&mut self, clean: &str) {
        self.pending.push_str(clean);
        if self.pending.len() > PENDING_CAP_BYTES {
            let excess = self.pending.len() - PENDING_CAP_BYTES;
            let cut = (excess..=self.pending.len())
                .find(|&i| self.pending.is_char_boundary(i))
                .unwrap_or(self.pending.len());
            self.pending.drain(..cut);
        }
    }

    /// 自动批准权限请求：发送一次确认并清空缓冲区
    fn approve(&mut self, pattern: &str) -> Result<()> {
        let response = format!("{}\r", self.settings.approval_response);
        self.session_mut()?.write_text(&response)?;
        self.pending.clear();

        info!(pattern = %pattern, "Permission request approved");
        self.log
            .note(&format!("Auto-approved permission request ({})", pattern));
        Ok(())
    }

    /// 子进程输出结束
    fn on_session_end(&mut self) -> Option<StopReason> {
        if let Some(deadline) = self.pending_rate_limit() {
            self.state = DriverState::AwaitingRateLimitWait(deadline);
            return None;
        }

        info!("Agent session exited");
        self.log.note("Session ended");
        Some(StopReason::SessionExited)
    }

    /// 空闲超时：限流等待，或续接下一阶段
    fn on_idle(&mut self, idle_for: Duration) -> Result<Option<StopReason>> {
        if let Some(deadline) = self.pending_rate_limit() {
            self.state = DriverState::AwaitingRateLimitWait(deadline);
            return Ok(None);
        }

        if let Some(max) = self.settings.max_iterations {
            if self.iterations >= max {
                info!(max = max, "Iteration limit reached");
                self.log
                    .note(&format!("Max iterations ({}) reached", max));
                return Ok(Some(StopReason::IterationLimit));
            }
        }

        self.iterations += 1;
        info!(
            iteration = self.iterations,
            idle_secs = idle_for.as_secs(),
            "Idle timeout, continuing with next phase"
        );
        self.log.note(&format!(
            "Idle for {}s, continuing (iteration {})",
            idle_for.as_secs(),
            self.iterations
        ));

        self.start_session()
    }

    fn pending_rate_limit(&self) -> Option<RateLimitDeadline> {
        if !self.settings.quota_wait {
            return None;
        }
        self.classifier.detect_rate_limit(&self.pending)
    }

    /// 等待额度重置，然后用下一阶段重新启动
    fn wait_for_quota(&mut self, deadline: RateLimitDeadline) -> Result<Option<StopReason>> {
        let wait = deadline.wait_from((self.clock)());

        warn!(reset_at = %deadline, wait_secs = wait.as_secs(), "Rate limited, waiting for quota reset");
        self.log.note(&format!(
            "Rate limited, waiting until {} ({})",
            deadline,
            format_wait(wait)
        ));

        if !self.pause.pause(wait, &self.shutdown) {
            return Ok(self.shutdown_reason());
        }

        info!("Quota wait finished, restarting session");
        self.state = DriverState::Starting;
        Ok(None)
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn AgentSession>> {
        self.session.as_mut().ok_or_else(|| anyhow!("没有活动的 agent 会话"))
    }

    /// 终止当前会话并清空与之相关的缓冲状态
    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.terminate() {
                warn!(error = %e, "Failed to terminate agent session");
            }
        }
        self.decoder = Utf8Decoder::new();
        self.sanitizer = StreamSanitizer::new();
        self.lines = LineBuffer::new();
        self.pending.clear();
        self.classifier.reset();
    }

    fn cleanup(&mut self) {
        self.end_session();
        self.log.close();
    }
}
