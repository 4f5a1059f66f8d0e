//! 过滤日志 - 只追加分类后有意义的输出和监管事件
//!
//! 写入方只有 Session Driver 的主循环线程。每条记录写完立即 flush，
//! 便于 `tail -f` 观察。

use crate::classifier::format_entry;
use anyhow::{Context, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// 分隔线宽度
const BANNER_WIDTH: usize = 60;

/// 过滤日志
pub struct FilteredLog {
    targets: Vec<Box<dyn Write + Send>>,
}

impl FilteredLog {
    /// 以追加方式打开日志文件；`echo` 为 true 时同时输出到 stdout
    pub fn open(path: &Path, echo: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("打开日志文件失败: {}", path.display()))?;

        let mut targets: Vec<Box<dyn Write + Send>> = vec![Box::new(BufWriter::new(file))];
        if echo {
            targets.push(Box::new(io::stdout()));
        }

        Ok(Self { targets })
    }

    /// 写入任意 writer（测试用）
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            targets: vec![Box::new(writer)],
        }
    }

    /// 丢弃所有输出
    pub fn disabled() -> Self {
        Self {
            targets: Vec::new(),
        }
    }

    /// 记录一条被接受的输出
    pub fn entry(&mut self, text: &str) {
        let line = format_entry(Local::now(), text);
        self.write_line(&line);
    }

    /// 记录监管事件，前后加分隔线
    pub fn note(&mut self, text: &str) {
        let rule = "=".repeat(BANNER_WIDTH);
        let body = format_entry(Local::now(), text);
        self.write_line(&format!("{}\n{}\n{}", rule, body, rule));
    }

    fn write_line(&mut self, line: &str) {
        for target in &mut self.targets {
            let result = writeln!(target, "{}", line).and_then(|_| target.flush());
            if let Err(e) = result {
                warn!(error = %e, "Failed to write filtered log");
            }
        }
    }

    /// flush 并关闭所有输出
    pub fn close(&mut self) {
        for mut target in self.targets.drain(..) {
            if let Err(e) = target.flush() {
                warn!(error = %e, "Failed to flush filtered log");
            }
        }
    }
}

impl Drop for FilteredLog {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_entries_appended_with_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "previous run\n").unwrap();

        let mut log = FilteredLog::open(&path, false).unwrap();
        log.entry("⏺ I'll read the file");
        log.entry("line one\nline two");
        log.close();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "previous run");
        assert!(lines[1].starts_with('['));
        assert!(lines[1].ends_with("] ⏺ I'll read the file"));
        assert!(lines[2].ends_with("] line one"));
        assert_eq!(lines[3], format!("{}line two", " ".repeat(11)));
    }

    #[test]
    fn test_note_wrapped_in_rules() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");

        let mut log = FilteredLog::open(&path, false).unwrap();
        log.note("Phase: A - Implement");
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "=".repeat(60));
        assert!(lines[1].ends_with("Phase: A - Implement"));
        assert_eq!(lines[2], "=".repeat(60));
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let mut log = FilteredLog::disabled();
        log.entry("anything");
        log.close();
        log.note("after close");
    }
}
