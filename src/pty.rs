//! PTY 会话模块 - 在伪终端中启动被监管的 CLI
//!
//! `SessionLauncher` / `AgentSession` 是 Session Driver 依赖的最小接口，
//! 测试中可以用脚本化的假会话替换。
//!
//! `PtySession` 的读取：portable-pty 的 reader 是阻塞的，由一个只负责搬运字节的
//! 线程把数据送进 channel，`read_chunk` 在 channel 上做带超时的接收。

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 读到数据
    Data(Vec<u8>),
    /// 超时内没有数据（不是错误）
    Timeout,
    /// 子进程输出结束
    Eof,
}

/// 被监管的子进程会话
pub trait AgentSession: Send {
    /// 读取一块输出，最多等待 `timeout`
    fn read_chunk(&mut self, timeout: Duration) -> Result<ReadOutcome>;

    /// 向子进程输入写入原始文本
    fn write_text(&mut self, text: &str) -> Result<()>;

    /// 子进程是否仍在运行
    fn is_alive(&mut self) -> bool;

    /// 终止子进程并释放句柄
    fn terminate(&mut self) -> Result<()>;

    /// 子进程 PID（如果可用）
    fn pid(&self) -> Option<u32>;
}

/// 会话启动器，每次调用都创建一个全新的子进程
pub trait SessionLauncher {
    fn launch(&mut self) -> Result<Box<dyn AgentSession>>;
}

enum ReaderMessage {
    Data(Vec<u8>),
    Eof,
}

/// portable-pty 实现的会话
pub struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    // 保持 master 打开，drop 时关闭 PTY
    _master: Box<dyn MasterPty + Send>,
    output: Receiver<ReaderMessage>,
    eof: bool,
}

impl PtySession {
    fn spawn_reader(mut reader: Box<dyn Read + Send>, max_read_bytes: usize) -> Result<Receiver<ReaderMessage>> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; max_read_bytes];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            let _ = tx.send(ReaderMessage::Eof);
                            break;
                        }
                        Ok(n) => {
                            if tx.send(ReaderMessage::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux 上子进程退出后读 master 返回 EIO
                            debug!(error = %e, "PTY reader finished");
                            let _ = tx.send(ReaderMessage::Eof);
                            break;
                        }
                    }
                }
            })
            .context("启动 PTY 读取线程失败")?;
        Ok(rx)
    }
}

impl AgentSession for PtySession {
    fn read_chunk(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        if self.eof {
            return Ok(ReadOutcome::Eof);
        }

        match self.output.recv_timeout(timeout) {
            Ok(ReaderMessage::Data(data)) => Ok(ReadOutcome::Data(data)),
            Ok(ReaderMessage::Eof) | Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                Ok(ReadOutcome::Eof)
            }
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::Timeout),
        }
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.flush())
            .context("写入子进程输入失败")
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        let pid = self.child.process_id();
        self.child.kill().context("终止子进程失败")?;

        // 最多等待 2 秒回收，避免留下僵尸进程
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = ?pid, status = ?status, "Child reaped");
                    return Ok(());
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(anyhow!("等待子进程退出失败: {}", e)),
            }
        }

        warn!(pid = ?pid, "Child did not exit within 2s after kill");
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(error = %e, "Failed to terminate child on drop");
        }
    }
}

/// 用 portable-pty 启动配置中的命令
pub struct PtyLauncher {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    size: PtySize,
    max_read_bytes: usize,
}

impl PtyLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, cwd: impl Into<PathBuf>, max_read_bytes: usize) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            size: PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            },
            max_read_bytes: max_read_bytes.max(1),
        }
    }
}

impl SessionLauncher for PtyLauncher {
    fn launch(&mut self) -> Result<Box<dyn AgentSession>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(self.size)
            .map_err(|e| anyhow!("openpty 失败: {}", e))?;

        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.cwd(&self.cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("启动 {} 失败: {}", self.program.display(), e))?;
        // 子进程已持有 slave，父进程关闭自己的副本，子进程退出后才能读到 EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("获取 PTY reader 失败: {}", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("获取 PTY writer 失败: {}", e))?;

        let output = PtySession::spawn_reader(reader, self.max_read_bytes)?;

        info!(
            program = %self.program.display(),
            pid = ?child.process_id(),
            cwd = %self.cwd.display(),
            "Agent session spawned"
        );

        Ok(Box::new(PtySession {
            child,
            writer,
            _master: pair.master,
            output,
            eof: false,
        }))
    }
}
