//! Prompt 阶段轮换模块 - A → B → C → A
//!
//! 读写顺序约定：
//! - 决策前读取（`peek_next` 每次都从存储读取上次已发送的阶段）
//! - 发送成功后写入（`commit`），发送失败时存储仍是上一次成功发送的阶段，
//!   重启不会跳过阶段

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Prompt 阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    /// 固定轮换：A→B→C→A
    pub fn next(self) -> Phase {
        match self {
            Phase::A => Phase::B,
            Phase::B => Phase::C,
            Phase::C => Phase::A,
        }
    }

    /// 给定上次发送的阶段，返回下一个应发送的阶段；没有记录时从 A 开始
    pub fn after(last_sent: Option<Phase>) -> Phase {
        last_sent.map(Phase::next).unwrap_or(Phase::A)
    }

    pub fn letter(self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(Phase::A),
            "B" => Ok(Phase::B),
            "C" => Ok(Phase::C),
            other => Err(anyhow!("Unknown phase: {}", other)),
        }
    }
}

/// 持久化 "上次已发送阶段" 的存储接口
pub trait PhaseStore: Send {
    /// 读取上次发送的阶段；没有记录或内容无法识别时返回 None
    fn load(&self) -> Result<Option<Phase>>;

    /// 记录刚刚发送成功的阶段
    fn save(&mut self, phase: Phase) -> Result<()>;
}

/// 基于文本文件的存储（文件内容就是阶段字母）
pub struct FilePhaseStore {
    path: PathBuf,
}

impl FilePhaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PhaseStore for FilePhaseStore {
    fn load(&self) -> Result<Option<Phase>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("读取阶段状态文件失败: {}", self.path.display()))?;

        match content.parse::<Phase>() {
            Ok(phase) => Ok(Some(phase)),
            Err(_) => {
                warn!(path = %self.path.display(), content = %content.trim(), "Unrecognized phase state, restarting cycle at A");
                Ok(None)
            }
        }
    }

    fn save(&mut self, phase: Phase) -> Result<()> {
        fs::write(&self.path, phase.letter())
            .with_context(|| format!("写入阶段状态文件失败: {}", self.path.display()))?;
        debug!(path = %self.path.display(), phase = %phase, "Phase state saved");
        Ok(())
    }
}

/// 内存存储，克隆体共享同一份状态（测试时可在外部观察写入结果）
#[derive(Debug, Clone, Default)]
pub struct MemoryPhaseStore {
    inner: Arc<Mutex<Option<Phase>>>,
}

impl MemoryPhaseStore {
    pub fn new(initial: Option<Phase>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn current(&self) -> Option<Phase> {
        self.inner.lock().ok().and_then(|guard| *guard)
    }
}

impl PhaseStore for MemoryPhaseStore {
    fn load(&self) -> Result<Option<Phase>> {
        let guard = self.inner.lock().map_err(|_| anyhow!("phase store poisoned"))?;
        Ok(*guard)
    }

    fn save(&mut self, phase: Phase) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| anyhow!("phase store poisoned"))?;
        *guard = Some(phase);
        Ok(())
    }
}

/// 阶段轮换器，唯一允许修改持久化阶段的组件
pub struct PhaseCycler {
    store: Box<dyn PhaseStore>,
}

impl PhaseCycler {
    pub fn new(store: Box<dyn PhaseStore>) -> Self {
        Self { store }
    }

    /// 下一个应发送的阶段（只读，不修改存储）
    pub fn peek_next(&self) -> Result<Phase> {
        Ok(Phase::after(self.store.load()?))
    }

    /// Prompt 实际发送后调用
    pub fn commit(&mut self, sent: Phase) -> Result<()> {
        self.store.save(sent)
    }
}
