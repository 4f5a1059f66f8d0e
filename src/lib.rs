//! Auto-Continue - 在 PTY 中监管 Claude CLI 会话
//!
//! 过滤终端输出、自动批准权限请求、等待限流重置，
//! 并在会话空闲时按阶段轮换注入下一条 prompt。

pub mod classifier;
pub mod cli;
pub mod config;
pub mod driver;
pub mod filtered_log;
pub mod lock;
pub mod phase;
pub mod pty;
pub mod rate_limit;
pub mod sanitizer;
pub mod signals;

pub use classifier::{ClassifierRules, LineBuffer, OutputClassifier, OutputEvent, ToolCallFingerprint};
pub use config::{Config, ConfigError, ConfigOverrides, PhasePrompts, PromptDefinition};
pub use driver::{DriverSettings, DriverState, SessionDriver, StopReason};
pub use filtered_log::FilteredLog;
pub use lock::{InstanceLock, LockError};
pub use phase::{FilePhaseStore, MemoryPhaseStore, Phase, PhaseCycler, PhaseStore};
pub use pty::{AgentSession, PtyLauncher, PtySession, ReadOutcome, SessionLauncher};
pub use rate_limit::{RateLimitDeadline, RateLimitDetector};
pub use sanitizer::{sanitize, Utf8Decoder};
pub use signals::{Pause, ShutdownFlag, ThreadPause};
