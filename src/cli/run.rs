// src/cli/run.rs
//! Run 命令 - 在 PTY 中监管 Claude CLI，空闲时自动续接下一阶段
//!
//! 启动顺序：加载配置 → 查找可执行文件 → 获取单实例锁 → 打印横幅 →
//! 注册信号 → 运行 Session Driver → 打印停止摘要 → 释放锁。

use crate::classifier::OutputClassifier;
use crate::config::{Config, ConfigOverrides};
use crate::driver::{DriverSettings, SessionDriver, StopReason};
use crate::filtered_log::FilteredLog;
use crate::lock::InstanceLock;
use crate::phase::{FilePhaseStore, Phase, PhaseCycler};
use crate::pty::PtyLauncher;
use crate::signals::ShutdownFlag;
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 正常结束
pub const EXIT_OK: i32 = 0;
/// 配置缺失或致命错误
pub const EXIT_FAILURE: i32 = 1;
/// 用户中断 (Ctrl+C)
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run 命令参数
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// 空闲多少秒后续接下一阶段（覆盖配置）
    #[arg(long)]
    pub timeout: Option<u64>,

    /// 最多续接次数，-1 表示不限（覆盖配置）
    #[arg(long, allow_negative_numbers = true)]
    pub max_iterations: Option<i64>,

    /// 限流时不等待额度重置，直接退出
    #[arg(long)]
    pub no_quota_wait: bool,

    /// 配置文件路径
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 项目根目录（默认当前目录）
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            timeout: self.timeout,
            max_iterations: self.max_iterations,
            no_quota_wait: self.no_quota_wait,
        }
    }
}

/// 处理 run 命令，返回进程退出码
pub fn handle_run(args: RunArgs) -> Result<i32> {
    let project_root = match &args.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("无法获取当前目录")?,
    };
    if !project_root.is_dir() {
        anyhow::bail!("项目目录不存在: {}", project_root.display());
    }

    // 1. 配置
    let config_path = Config::resolve_path(args.config.as_deref(), &project_root);
    let mut config = Config::load(&config_path)?;
    config.apply_overrides(&args.overrides())?;
    let program = config.resolve_command()?;
    info!(config = %config_path.display(), program = %program.display(), "Configuration loaded");

    // 2. 单实例锁
    let mut lock = InstanceLock::acquire(InstanceLock::default_path())?;

    // 3. 组装 driver
    let cycler = PhaseCycler::new(Box::new(FilePhaseStore::new(config.state_path(&project_root))));
    let next_phase = cycler.peek_next()?;
    let log_path = config.log_path(&project_root);
    let log = FilteredLog::open(&log_path, config.echo_output)?;

    println!("{}", banner(&config, &project_root, &log_path, next_phase));

    let shutdown = ShutdownFlag::new();
    shutdown.install()?;

    let launcher = PtyLauncher::new(
        program,
        config.args.clone(),
        &project_root,
        config.max_read_bytes,
    );
    let mut driver = SessionDriver::new(
        DriverSettings::from_config(&config),
        Box::new(launcher),
        cycler,
        config.prompts.clone(),
        OutputClassifier::new(config.classifier_rules()),
        log,
        shutdown,
    );

    // 4. 运行
    let reason = driver.run();
    println!("{}", stop_summary(&reason, driver.iterations(), driver.elapsed()));

    if let Err(e) = lock.release() {
        warn!(error = %e, "Failed to release instance lock");
    }

    Ok(exit_code(&reason))
}

/// 停止原因对应的退出码
pub fn exit_code(reason: &StopReason) -> i32 {
    match reason {
        StopReason::Interrupted => EXIT_INTERRUPTED,
        StopReason::Failed(_) => EXIT_FAILURE,
        StopReason::SessionExited | StopReason::IterationLimit | StopReason::Terminated => EXIT_OK,
    }
}

/// 启动横幅
pub fn banner(config: &Config, project_root: &Path, log_path: &Path, next: Phase) -> String {
    let rule = "=".repeat(60);
    let max_iterations = match config.max_iterations {
        Some(max) => max.to_string(),
        None => "不限".to_string(),
    };

    let mut lines = vec![
        rule.clone(),
        "Auto-Continue - Claude 会话自动续接".to_string(),
        rule.clone(),
        format!("项目目录:   {}", project_root.display()),
        format!("空闲超时:   {}s", config.idle_timeout.as_secs()),
        format!("最大续接:   {}", max_iterations),
        format!("限流等待:   {}", if config.quota_wait { "开启" } else { "关闭" }),
        format!("过滤日志:   {}", log_path.display()),
        "阶段轮换:".to_string(),
    ];
    for (phase, prompt) in config.prompts.iter() {
        let marker = if phase == next { "→" } else { " " };
        let model = if prompt.model_preference.is_empty() {
            String::new()
        } else {
            format!(" [{}]", prompt.model_preference)
        };
        lines.push(format!("  {} {}: {}{}", marker, phase, prompt.name, model));
    }
    lines.push(format!("下一阶段:   {}", next));
    lines.push(rule);

    lines.join("\n")
}

/// 停止摘要
pub fn stop_summary(reason: &StopReason, iterations: u32, elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "\n已停止: {}\n续接次数: {}\n运行时长: {}h {:02}m {:02}s",
        reason,
        iterations,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}
