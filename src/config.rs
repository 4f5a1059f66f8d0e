//! 配置模块 - 加载并校验 auto-continue 配置文件
//!
//! 配置文件是 JSON，结构与脚本时代的 `auto-continue-config.json` 兼容：
//! `timeout` / `max_iterations` / `enable_quota_wait` / `prompts` /
//! `permission_patterns` / `rate_limit_pattern`，其余字段都有默认值。
//! 加载时一次性校验（阶段完整、正则可编译、捕获组数量），失败时返回具体的
//! `ConfigError`。

use crate::classifier::ClassifierRules;
use crate::phase::Phase;
use crate::rate_limit::RateLimitDetector;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// 项目内默认配置路径（相对项目根目录）
pub const PROJECT_CONFIG_PATH: &str = "scripts/auto-continue-config.json";

/// 默认状态文件名
pub const DEFAULT_STATE_FILE: &str = ".auto-continue-state";

/// 默认过滤日志文件名
pub const DEFAULT_LOG_FILE: &str = ".auto-continue.log";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    NotFound(PathBuf),

    #[error("读取配置文件失败: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件格式错误 ({origin}): {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("缺少必需的配置项: {0}")]
    MissingKey(&'static str),

    #[error("缺少阶段 {0} 的 prompt 定义")]
    MissingPhase(Phase),

    #[error("无效的正则表达式 ({field}): {pattern}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rate_limit_pattern 需要两个捕获组（小时、AM/PM）: {0}")]
    RateLimitGroups(String),

    #[error("无效的配置值 {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("找不到可执行文件: {0}\n请确认已安装并在 PATH 中")]
    CommandNotFound(String),
}

/// 单个阶段的 prompt 定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDefinition {
    /// 显示名称
    pub name: String,
    /// 原样注入的文本
    pub text: String,
    /// 建议使用的模型（仅展示）
    #[serde(default)]
    pub model_preference: String,
}

/// 三个阶段的 prompt，校验后保证齐全
#[derive(Debug, Clone)]
pub struct PhasePrompts {
    a: PromptDefinition,
    b: PromptDefinition,
    c: PromptDefinition,
}

impl PhasePrompts {
    pub fn new(a: PromptDefinition, b: PromptDefinition, c: PromptDefinition) -> Self {
        Self { a, b, c }
    }

    pub fn get(&self, phase: Phase) -> &PromptDefinition {
        match phase {
            Phase::A => &self.a,
            Phase::B => &self.b,
            Phase::C => &self.c,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, &PromptDefinition)> {
        Phase::ALL.into_iter().map(move |phase| (phase, self.get(phase)))
    }
}

/// 配置文件的原始结构
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_max_iterations")]
    max_iterations: i64,
    #[serde(default = "default_true")]
    enable_quota_wait: bool,
    prompts: Option<BTreeMap<String, PromptDefinition>>,
    permission_patterns: Option<Vec<String>>,
    rate_limit_pattern: Option<String>,

    #[serde(default = "default_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_read_timeout_ms")]
    read_timeout_ms: u64,
    #[serde(default = "default_max_read_bytes")]
    max_read_bytes: usize,
    #[serde(default = "default_approval_response")]
    approval_response: String,
    #[serde(default = "default_startup_delay_ms")]
    startup_delay_ms: u64,
    #[serde(default = "default_submit_delay_ms")]
    submit_delay_ms: u64,
    #[serde(default = "default_state_file")]
    state_file: PathBuf,
    #[serde(default = "default_log_file")]
    log_file: PathBuf,
    #[serde(default = "default_true")]
    echo_output: bool,
    #[serde(default)]
    extra_noise_patterns: Vec<String>,
    #[serde(default)]
    extra_meaningful_patterns: Vec<String>,
}

fn default_timeout() -> u64 {
    180
}
fn default_max_iterations() -> i64 {
    -1
}
fn default_true() -> bool {
    true
}
fn default_command() -> String {
    "claude".to_string()
}
fn default_read_timeout_ms() -> u64 {
    500
}
fn default_max_read_bytes() -> usize {
    4096
}
fn default_approval_response() -> String {
    "1".to_string()
}
fn default_startup_delay_ms() -> u64 {
    3000
}
fn default_submit_delay_ms() -> u64 {
    500
}
fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}
fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

/// 校验后的配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 空闲多久后注入下一条 prompt
    pub idle_timeout: Duration,
    /// 最多自动续接次数，None 表示不限
    pub max_iterations: Option<u32>,
    /// 是否在限流时等待额度重置
    pub quota_wait: bool,
    pub prompts: PhasePrompts,
    pub permission_patterns: Vec<Regex>,
    pub rate_limit_pattern: Regex,
    pub command: String,
    pub args: Vec<String>,
    pub read_timeout: Duration,
    pub max_read_bytes: usize,
    pub approval_response: String,
    pub startup_delay: Duration,
    pub submit_delay: Duration,
    /// 相对路径按项目根目录解析
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub echo_output: bool,
    pub extra_noise_patterns: Vec<Regex>,
    pub extra_meaningful_patterns: Vec<Regex>,
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub timeout: Option<u64>,
    pub max_iterations: Option<i64>,
    pub no_quota_wait: bool,
}

impl Config {
    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loading config");
        Self::parse(&content, &path.display().to_string())
    }

    /// 从 JSON 字符串解析，`origin` 只用于错误信息
    pub fn parse(json: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.timeout == 0 {
            return Err(invalid("timeout", "必须大于 0"));
        }
        if raw.read_timeout_ms == 0 {
            return Err(invalid("read_timeout_ms", "必须大于 0"));
        }
        if raw.max_read_bytes == 0 {
            return Err(invalid("max_read_bytes", "必须大于 0"));
        }
        if raw.command.trim().is_empty() {
            return Err(invalid("command", "不能为空"));
        }

        let max_iterations = parse_max_iterations(raw.max_iterations)?;

        let raw_prompts = raw.prompts.ok_or(ConfigError::MissingKey("prompts"))?;
        let mut by_phase: BTreeMap<Phase, PromptDefinition> = BTreeMap::new();
        for (key, prompt) in raw_prompts {
            match key.parse::<Phase>() {
                Ok(phase) => {
                    by_phase.insert(phase, prompt);
                }
                Err(_) => warn!(key = %key, "Ignoring prompt for unknown phase"),
            }
        }
        let mut take = |phase: Phase| by_phase.remove(&phase).ok_or(ConfigError::MissingPhase(phase));
        let prompts = PhasePrompts::new(take(Phase::A)?, take(Phase::B)?, take(Phase::C)?);

        let permission_patterns = raw
            .permission_patterns
            .ok_or(ConfigError::MissingKey("permission_patterns"))?
            .iter()
            .map(|p| compile(p, "permission_patterns", true))
            .collect::<Result<Vec<_>, _>>()?;

        let rate_limit_source = raw
            .rate_limit_pattern
            .ok_or(ConfigError::MissingKey("rate_limit_pattern"))?;
        let rate_limit_pattern = compile(&rate_limit_source, "rate_limit_pattern", true)?;
        // captures_len 包含第 0 组
        if rate_limit_pattern.captures_len() < 3 {
            return Err(ConfigError::RateLimitGroups(rate_limit_source));
        }

        let extra_noise_patterns = raw
            .extra_noise_patterns
            .iter()
            .map(|p| compile(p, "extra_noise_patterns", false))
            .collect::<Result<Vec<_>, _>>()?;
        let extra_meaningful_patterns = raw
            .extra_meaningful_patterns
            .iter()
            .map(|p| compile(p, "extra_meaningful_patterns", false))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            idle_timeout: Duration::from_secs(raw.timeout),
            max_iterations,
            quota_wait: raw.enable_quota_wait,
            prompts,
            permission_patterns,
            rate_limit_pattern,
            command: raw.command,
            args: raw.args,
            read_timeout: Duration::from_millis(raw.read_timeout_ms),
            max_read_bytes: raw.max_read_bytes,
            approval_response: raw.approval_response,
            startup_delay: Duration::from_millis(raw.startup_delay_ms),
            submit_delay: Duration::from_millis(raw.submit_delay_ms),
            state_file: raw.state_file,
            log_file: raw.log_file,
            echo_output: raw.echo_output,
            extra_noise_patterns,
            extra_meaningful_patterns,
        })
    }

    /// 应用命令行覆盖
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(timeout) = overrides.timeout {
            if timeout == 0 {
                return Err(invalid("timeout", "必须大于 0"));
            }
            self.idle_timeout = Duration::from_secs(timeout);
        }
        if let Some(max) = overrides.max_iterations {
            self.max_iterations = parse_max_iterations(max)?;
        }
        if overrides.no_quota_wait {
            self.quota_wait = false;
        }
        Ok(())
    }

    /// 配置文件查找顺序：显式路径 > 项目内 scripts/ > 用户配置目录
    pub fn resolve_path(explicit: Option<&Path>, project_root: &Path) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        let project_config = project_root.join(PROJECT_CONFIG_PATH);
        if project_config.exists() {
            return project_config;
        }

        dirs::config_dir()
            .map(|dir| dir.join("auto-continue").join("config.json"))
            .filter(|path| path.exists())
            .unwrap_or(project_config)
    }

    /// 解析相对项目根目录的路径
    pub fn state_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.state_file)
    }

    pub fn log_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.log_file)
    }

    /// 在 PATH 中查找被监管的命令
    pub fn resolve_command(&self) -> Result<PathBuf, ConfigError> {
        which::which(&self.command).map_err(|_| ConfigError::CommandNotFound(self.command.clone()))
    }

    /// 构建分类规则
    pub fn classifier_rules(&self) -> ClassifierRules {
        ClassifierRules::new(
            self.permission_patterns.clone(),
            Some(RateLimitDetector::new(self.rate_limit_pattern.clone())),
        )
        .with_extra_noise(self.extra_noise_patterns.iter().cloned())
        .with_extra_meaningful(self.extra_meaningful_patterns.iter().cloned())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// -1 表示不限次数
fn parse_max_iterations(value: i64) -> Result<Option<u32>, ConfigError> {
    match value {
        -1 => Ok(None),
        v if v < -1 => Err(invalid("max_iterations", "必须是非负整数，或 -1 表示不限")),
        v => u32::try_from(v)
            .map(Some)
            .map_err(|_| invalid("max_iterations", "数值过大")),
    }
}

fn compile(pattern: &str, field: &'static str, case_insensitive: bool) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            field,
            pattern: pattern.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"{
        "prompts": {
            "A": {"name": "Implement", "text": "Continue implementing", "model_preference": "opus"},
            "B": {"name": "Review", "text": "Review recent changes"},
            "C": {"name": "Plan", "text": "Update the plan", "model_preference": "sonnet"}
        },
        "permission_patterns": ["Do you want to proceed", "\\[Y/n\\]"],
        "rate_limit_pattern": "try again at (\\d{1,2})\\s*(am|pm)"
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::parse(MINIMAL, "test").unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.max_iterations, None);
        assert!(config.quota_wait);
        assert_eq!(config.command, "claude");
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert_eq!(config.max_read_bytes, 4096);
        assert_eq!(config.approval_response, "1");
        assert_eq!(config.state_file, PathBuf::from(".auto-continue-state"));
        assert_eq!(config.prompts.get(Phase::B).name, "Review");
        assert_eq!(config.prompts.get(Phase::B).model_preference, "");
    }

    #[test]
    fn test_patterns_case_insensitive() {
        let config = Config::parse(MINIMAL, "test").unwrap();
        assert!(config.permission_patterns[0].is_match("DO YOU WANT TO PROCEED?"));
        assert!(config.rate_limit_pattern.is_match("Try Again At 5PM"));
    }

    #[test]
    fn test_missing_prompts_key() {
        let err = Config::parse(r#"{"permission_patterns": [], "rate_limit_pattern": "(a)(b)"}"#, "t")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("prompts")));
    }

    #[test]
    fn test_missing_phase() {
        let json = r#"{
            "prompts": {"A": {"name": "a", "text": "a"}, "B": {"name": "b", "text": "b"}},
            "permission_patterns": [],
            "rate_limit_pattern": "(\\d+)(am|pm)"
        }"#;
        let err = Config::parse(json, "t").unwrap_err();
        assert!(matches!(err, ConfigError::MissingPhase(Phase::C)));
    }

    #[test]
    fn test_rate_limit_pattern_needs_two_groups() {
        let json = MINIMAL.replace(r#"try again at (\\d{1,2})\\s*(am|pm)"#, r#"try again at (\\d+)"#);
        let err = Config::parse(&json, "t").unwrap_err();
        assert!(matches!(err, ConfigError::RateLimitGroups(_)));
    }

    #[test]
    fn test_invalid_regex_reported() {
        let json = MINIMAL.replace(r#""Do you want to proceed""#, r#""(unclosed""#);
        let err = Config::parse(&json, "t").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidPattern { field: "permission_patterns", .. }
        ));
    }

    #[test]
    fn test_max_iterations_validation() {
        assert_eq!(parse_max_iterations(-1).unwrap(), None);
        assert_eq!(parse_max_iterations(0).unwrap(), Some(0));
        assert_eq!(parse_max_iterations(5).unwrap(), Some(5));
        assert!(parse_max_iterations(-2).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::parse(MINIMAL, "test").unwrap();
        config
            .apply_overrides(&ConfigOverrides {
                timeout: Some(30),
                max_iterations: Some(3),
                no_quota_wait: true,
            })
            .unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_iterations, Some(3));
        assert!(!config.quota_wait);

        let err = config
            .apply_overrides(&ConfigOverrides {
                timeout: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "timeout", .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_resolve_path_prefers_explicit_then_project() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("custom.json");
        assert_eq!(Config::resolve_path(Some(&explicit), dir.path()), explicit);

        let project = dir.path().join(PROJECT_CONFIG_PATH);
        fs::create_dir_all(project.parent().unwrap()).unwrap();
        fs::write(&project, MINIMAL).unwrap();
        assert_eq!(Config::resolve_path(None, dir.path()), project);
    }

    #[test]
    fn test_prompts_iterate_in_cycle_order() {
        let config = Config::parse(MINIMAL, "test").unwrap();
        let names: Vec<_> = config.prompts.iter().map(|(p, d)| (p, d.name.as_str())).collect();
        assert_eq!(
            names,
            vec![(Phase::A, "Implement"), (Phase::B, "Review"), (Phase::C, "Plan")]
        );
    }
}
