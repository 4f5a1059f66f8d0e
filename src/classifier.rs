//! 输出分类模块 - 把清洗后的终端文本分为噪音 / 有意义内容 / 控制事件
//!
//! 单行分类的判定顺序：
//! 1. 过短（< 3 字符）直接丢弃
//! 2. 工具调用指纹去重（工具名 + 参数前 50 字符），重绘只保留第一次
//! 3. 权限请求 / 限流提示
//! 4. 噪音规则（分隔线、快捷键提示、"esc to interrupt"、Running… 等）
//! 5. spinner 字符且不满足白名单
//! 6. 白名单：只有命中至少一条 "有意义" 规则的行才会输出
//! 7. 与上一条输出完全相同的行被抑制
//!
//! 权限 / 限流检测还有一条独立路径：Session Driver 对累积的未过滤缓冲区调用
//! `detect_permission` / `detect_rate_limit`，不受上面去重和白名单的影响。

use crate::rate_limit::{RateLimitDeadline, RateLimitDetector};
use chrono::{DateTime, Local};
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

/// 少于此字符数的文本视为噪音
pub const MIN_CONTENT_CHARS: usize = 3;

/// 工具调用指纹中参数的截断长度
pub const FINGERPRINT_ARG_CHARS: usize = 50;

/// 单行未结束时最多缓存的字符数，超过后强制作为一行输出
pub const MAX_PARTIAL_LINE_CHARS: usize = 4096;

/// UI 装饰噪音
pub static NOISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 分隔线
        r"^[─━═╌┄\-_]{3,}$",
        // 输入框边框
        r"^[╭╰][─━]",
        r"^│.*│$",
        // 快捷键提示
        r"(?i)\?\s+for shortcuts",
        r"(?i)\b(ctrl|shift|alt|cmd)\+\w+\s+to\s+\w+",
        r"(?i)auto-accept edits",
        // 中断提示
        r"(?i)\besc\s+to\s+(interrupt|cancel)",
        r"(?i)press\s+\S+\s+to\s+interrupt",
        // 临时的 Running… 标记
        r"(?i)^\W*running(…|\.\.\.)?\s*$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// 动画 spinner 字符
pub static SPINNER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[✻✶✽✢✳✺·⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏◐◓◑◒]").expect("valid spinner regex")
});

/// 有意义内容的白名单
pub static MEANINGFUL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 前导标记符
        r"^[⏺●•◆▶⎿]\s*\S",
        // 第一人称回复开头
        r"^(?:I'll|I will|I'm|I am|I've|Let me|Let's|Now|Next|First|Looking|Great|Perfect)\b",
        // 简短确认
        r"^(?i:ok|okay|done|yes|no|got it|sure)[.!]?$",
        // 显式前缀
        r"^(?:Tool|Error):",
        // 权限对话措辞
        r"(?i)(do you want to|would you like to|allow|permission|proceed\?|\[y/n\])",
        // 列表项
        r"^(?:\d+[.)]|[-*])\s+\S",
        // 状态符号
        r"^[⚠✓✔✗✘❯]",
        // 工具调用
        r"^[A-Z][A-Za-z0-9_]*\(",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static TOOL_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[⏺●•]\s*)?([A-Z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\((.*)$")
        .expect("valid tool call regex")
});

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// 噪音（或重复），不输出
    Noise,
    /// 有意义内容（已 trim）
    Meaningful(String),
    /// 权限请求，携带命中的模式
    PermissionRequest { pattern: String },
    /// 限流提示
    RateLimitNotice(RateLimitDeadline),
}

impl OutputEvent {
    pub fn is_noise(&self) -> bool {
        matches!(self, OutputEvent::Noise)
    }
}

/// 工具调用去重键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCallFingerprint {
    pub tool: String,
    pub args_prefix: String,
}

impl ToolCallFingerprint {
    /// 从一行文本解析工具调用指纹，例如 `⏺ Bash(npm test)`
    pub fn parse(line: &str) -> Option<Self> {
        let caps = TOOL_CALL.captures(line.trim())?;
        let tool = caps.get(1)?.as_str().to_string();
        let args = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let args = args.trim_end().trim_end_matches(')');
        Some(Self {
            tool,
            args_prefix: args.chars().take(FINGERPRINT_ARG_CHARS).collect(),
        })
    }
}

/// 分类规则集合
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    noise: Vec<Regex>,
    meaningful: Vec<Regex>,
    permission: Vec<Regex>,
    rate_limit: Option<RateLimitDetector>,
}

impl ClassifierRules {
    /// 内置噪音 / 白名单规则 + 配置中的权限与限流规则
    pub fn new(permission: Vec<Regex>, rate_limit: Option<RateLimitDetector>) -> Self {
        Self {
            noise: NOISE_PATTERNS.clone(),
            meaningful: MEANINGFUL_PATTERNS.clone(),
            permission,
            rate_limit,
        }
    }

    pub fn with_extra_noise(mut self, extra: impl IntoIterator<Item = Regex>) -> Self {
        self.noise.extend(extra);
        self
    }

    pub fn with_extra_meaningful(mut self, extra: impl IntoIterator<Item = Regex>) -> Self {
        self.meaningful.extend(extra);
        self
    }

    fn is_noise(&self, text: &str) -> bool {
        self.noise.iter().any(|re| re.is_match(text))
    }

    fn is_meaningful(&self, text: &str) -> bool {
        self.meaningful.iter().any(|re| re.is_match(text))
    }
}

/// 输出分类器（带去重状态，每个会话一份）
pub struct OutputClassifier {
    rules: ClassifierRules,
    seen_tool_calls: HashSet<ToolCallFingerprint>,
    last_emitted: Option<u64>,
}

impl OutputClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self {
            rules,
            seen_tool_calls: HashSet::new(),
            last_emitted: None,
        }
    }

    /// 分类一行清洗后的文本
    pub fn classify(&mut self, text: &str) -> OutputEvent {
        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_CONTENT_CHARS {
            return OutputEvent::Noise;
        }

        if let Some(fingerprint) = ToolCallFingerprint::parse(trimmed) {
            if !self.seen_tool_calls.insert(fingerprint) {
                return OutputEvent::Noise;
            }
        }

        let event = if let Some(pattern) = self.detect_permission(trimmed) {
            OutputEvent::PermissionRequest {
                pattern: pattern.to_string(),
            }
        } else if let Some(deadline) = self.detect_rate_limit(trimmed) {
            OutputEvent::RateLimitNotice(deadline)
        } else if self.rules.is_noise(trimmed) {
            return OutputEvent::Noise;
        } else {
            let meaningful = self.rules.is_meaningful(trimmed);
            // spinner 行只有同时命中白名单才保留
            if SPINNER_PATTERN.is_match(trimmed) && !meaningful {
                return OutputEvent::Noise;
            }
            if !meaningful {
                return OutputEvent::Noise;
            }
            OutputEvent::Meaningful(trimmed.to_string())
        };

        let hash = hash_content(trimmed);
        if self.last_emitted == Some(hash) {
            return OutputEvent::Noise;
        }
        self.last_emitted = Some(hash);

        event
    }

    /// 在累积输出中检测权限请求，返回命中的模式
    pub fn detect_permission(&self, text: &str) -> Option<&str> {
        self.rules
            .permission
            .iter()
            .find(|re| re.is_match(text))
            .map(|re| re.as_str())
    }

    /// 在累积输出中检测限流提示
    pub fn detect_rate_limit(&self, text: &str) -> Option<RateLimitDeadline> {
        self.rules.rate_limit.as_ref()?.detect(text)
    }

    /// 新会话开始时清空去重状态
    pub fn reset(&mut self) {
        self.seen_tool_calls.clear();
        self.last_emitted = None;
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// 把 PTY 文本切分为行；未结束的行缓存到下一块
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加文本，返回所有已结束（`\n` 或 `\r`）的行
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in text.chars() {
            if ch == '\n' || ch == '\r' {
                if !self.partial.is_empty() {
                    lines.push(std::mem::take(&mut self.partial));
                }
            } else {
                self.partial.push(ch);
            }
        }

        if self.partial.chars().count() > MAX_PARTIAL_LINE_CHARS {
            lines.push(std::mem::take(&mut self.partial));
        }
        lines
    }

    /// 取出未结束的行
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// 格式化日志条目：首行带时间戳，后续行缩进对齐到正文
pub fn format_entry(at: DateTime<Local>, text: &str) -> String {
    let stamp = format!("[{}]", at.format("%H:%M:%S"));
    let indent = " ".repeat(stamp.chars().count() + 1);

    let mut out = String::new();
    for (i, line) in text.lines().enumerate() {
        if i == 0 {
            out.push_str(&stamp);
            out.push(' ');
        } else {
            out.push('\n');
            out.push_str(&indent);
        }
        out.push_str(line);
    }
    if out.is_empty() {
        out.push_str(&stamp);
    }
    out
}
