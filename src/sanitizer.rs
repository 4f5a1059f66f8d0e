//! 终端流清洗模块 - 从 PTY 原始输出中移除控制序列
//!
//! 处理顺序：
//! 1. 固定的开关序列（光标显隐、bracketed paste、焦点上报、同步输出）
//! 2. OSC 序列：`ESC ] ... BEL` 或 `ESC ] ... ESC \`
//! 3. CSI 序列：`ESC [ 参数 中间字节 终止字节(0x40-0x7E)`
//! 4. 其他 ESC 引导的两字节/nF 序列
//! 5. 残留的孤立 ESC（被截断的序列）
//!
//! 所有模式都以 ESC 开头，最后一步删除残留 ESC 后输出中不会再出现任何控制序列，
//! 因此清洗是幂等的。

use regex::Regex;
use std::sync::LazyLock;

/// 不完全被通用模式覆盖的命名开关序列
pub const NAMED_TOGGLES: &[&str] = &[
    "\x1b[?25l",
    "\x1b[?25h",
    "\x1b[?2004h",
    "\x1b[?2004l",
    "\x1b[?1004h",
    "\x1b[?1004l",
    "\x1b[?2026h",
    "\x1b[?2026l",
];

static OSC_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("valid OSC regex"));

static CSI_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[\x30-\x3F]*[\x20-\x2F]*[\x40-\x7E]").expect("valid CSI regex")
});

static OTHER_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b[\x20-\x2F]*[\x30-\x7E]").expect("valid escape regex"));

/// 清洗一段终端文本，返回只包含可见内容的 "clean" 视图
pub fn sanitize(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }

    let mut result = text.to_string();
    for toggle in NAMED_TOGGLES {
        if result.contains(toggle) {
            result = result.replace(toggle, "");
        }
    }

    let result = OSC_SEQUENCE.replace_all(&result, "");
    let result = CSI_SEQUENCE.replace_all(&result, "");
    let result = OTHER_ESCAPE.replace_all(&result, "");

    result.replace('\x1b', "")
}

/// 去除控制序列后的非空白字符数，用于判断一次读取是否有 "实质" 输出
pub fn visible_len(clean: &str) -> usize {
    clean.trim().chars().count()
}

/// 增量 UTF-8 解码器
///
/// PTY 读取按字节切分，一个多字节字符可能被拆到两次读取里。
/// 不完整的尾部字节会保留到下一次 `decode`；真正非法的字节替换为 U+FFFD。
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or(""));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // 不完整的多字节序列，等待下一块
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// 输出残留字节（流结束时调用）
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// 跨读取保留的未结束控制序列上限，超过后按普通文本清洗
pub const MAX_ESCAPE_CARRY: usize = 4096;

/// 流式清洗器
///
/// 一次 PTY 读取可能在控制序列中间结束（例如 `ESC [38;5;2` 或没有终止符的
/// OSC 标题）。未结束的尾部序列保留到下一次 `push`，避免参数字节作为可见文本泄漏。
#[derive(Debug, Default)]
pub struct StreamSanitizer {
    carry: String,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一块文本，返回可以安全输出的清洗结果
    pub fn push(&mut self, text: &str) -> String {
        let mut combined = std::mem::take(&mut self.carry);
        combined.push_str(text);

        match incomplete_escape_start(&combined) {
            Some(start) if combined.len() - start <= MAX_ESCAPE_CARRY => {
                self.carry = combined.split_off(start);
                sanitize(&combined)
            }
            _ => sanitize(&combined),
        }
    }

    /// 流结束时清洗残留内容
    pub fn finish(&mut self) -> String {
        sanitize(&std::mem::take(&mut self.carry))
    }
}

/// 找到结尾处未结束的控制序列的起始位置
fn incomplete_escape_start(text: &str) -> Option<usize> {
    // OSC 以 BEL 或 ESC \ 结束，正文中可以出现任意可见字符
    if let Some(start) = text.rfind("\x1b]") {
        let body = &text[start + 2..];
        if !body.contains('\x07') && !body.contains("\x1b\\") {
            return Some(start);
        }
    }

    let start = text.rfind('\x1b')?;
    let mut rest = text[start + 1..].chars();
    let pending = match rest.next() {
        None => true,
        // CSI：还没出现终止字节
        Some('[') => rest.all(|c| ('\x20'..='\x3f').contains(&c)),
        // nF：只有中间字节
        Some(c) if ('\x20'..='\x2f').contains(&c) => rest.all(|c| ('\x20'..='\x2f').contains(&c)),
        Some(_) => false,
    };
    pending.then_some(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_control_sequence(s: &str) -> bool {
        s.contains('\x1b')
            || OSC_SEQUENCE.is_match(s)
            || CSI_SEQUENCE.is_match(s)
            || OTHER_ESCAPE.is_match(s)
    }

    #[test]
    fn test_clean_text_unchanged() {
        let text = "⏺ I'll read the file first.\n  1. Yes\n  2. No";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn test_strip_csi_colors_and_cursor() {
        let raw = "\x1b[1;32mDone\x1b[0m \x1b[2K\x1b[1A\x1b[38;5;246mnext\x1b[39m";
        assert_eq!(sanitize(raw), "Done next");
    }

    #[test]
    fn test_strip_osc_title() {
        let raw = "\x1b]0;claude - project\x07Hello\x1b]8;;http://x\x1b\\link";
        assert_eq!(sanitize(raw), "Hellolink");
    }

    #[test]
    fn test_strip_named_toggles() {
        let raw = "\x1b[?25l\x1b[?2004hprompt\x1b[?1004h\x1b[?2026h\x1b[?2026l\x1b[?25h";
        assert_eq!(sanitize(raw), "prompt");
    }

    #[test]
    fn test_strip_charset_and_keypad_escapes() {
        let raw = "\x1b(Btext\x1b=\x1b>\x1b7more\x1b8";
        assert_eq!(sanitize(raw), "textmore");
    }

    #[test]
    fn test_dangling_escape_removed() {
        let raw = "partial\x1b";
        assert_eq!(sanitize(raw), "partial");

        let nested = "\x1b\x1b[0m[0m";
        let clean = sanitize(nested);
        assert!(!has_control_sequence(&clean));
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "\x1b[31mred\x1b[0m plain",
            "\x1b]2;t\x07\x1b[?25l⠋ Thinking…",
            "\x1b\x1b[[1;2;3mweird\x1b[",
            "no escapes at all",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "input: {:?}", input);
            assert!(!has_control_sequence(&once), "input: {:?}", input);
        }
    }

    #[test]
    fn test_invalid_bytes_then_sanitize() {
        let mut decoder = Utf8Decoder::new();
        let text = decoder.decode(b"ok \xff\x1b[0mdone");
        assert_eq!(sanitize(&text), "ok \u{FFFD}done");
    }

    #[test]
    fn test_visible_len() {
        assert_eq!(visible_len("   \n  "), 0);
        assert_eq!(visible_len("  ⏺ hi "), 4);
    }

    #[test]
    fn test_decoder_joins_split_multibyte() {
        let glyph = "⏺".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let first = decoder.decode(&glyph[..1]);
        assert_eq!(first, "");
        let second = decoder.decode(&[&glyph[1..], b" Read"].concat());
        assert_eq!(second, "⏺ Read");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xe2\x8f"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_stream_holds_split_csi() {
        let mut stream = StreamSanitizer::new();
        let first = stream.push("ready \x1b[38;5;2");
        assert_eq!(first, "ready ");
        assert_eq!(visible_len(&first), 5);

        assert_eq!(stream.push("46mcolored\x1b[0m"), "colored");
        assert_eq!(stream.finish(), "");
    }

    #[test]
    fn test_stream_holds_split_osc_title() {
        let mut stream = StreamSanitizer::new();
        assert_eq!(stream.push("\x1b]0;✳ Claude Code working"), "");
        assert_eq!(stream.push(" on task\x07⏺ Done"), "⏺ Done");

        // ST 终止符本身被拆开
        assert_eq!(stream.push("\x1b]2;title\x1b"), "");
        assert_eq!(stream.push("\\text"), "text");
    }

    #[test]
    fn test_stream_passes_complete_sequences() {
        let mut stream = StreamSanitizer::new();
        assert_eq!(stream.push("\x1b[1mbold\x1b[0m plain"), "bold plain");
        assert_eq!(stream.push("partial\x1b"), "partial");
        assert_eq!(stream.push("(Bcharset"), "charset");
    }

    #[test]
    fn test_stream_releases_oversized_carry() {
        let mut stream = StreamSanitizer::new();
        let unterminated = format!("\x1b]0;{}", "x".repeat(MAX_ESCAPE_CARRY));
        let out = stream.push(&unterminated);
        assert!(!has_control_sequence(&out));
        assert_eq!(stream.finish(), "");
    }
}
