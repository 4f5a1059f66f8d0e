//! 单实例锁 - 基于 PID 文件的本机互斥
//!
//! 锁文件内容是持有者的十进制 PID。获取时：
//! - 文件存在且持有者进程存活 → 拒绝启动
//! - 文件存在但持有者已退出 / 内容无法解析 → 视为陈旧锁，删除后重新创建
//! - 文件不存在 → 直接创建
//!
//! 新锁文件以 create-new 方式创建，并在持有期间加 fs2 独占建议锁。

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{debug, info, warn};

/// 默认锁文件名（位于系统临时目录）
pub const LOCK_FILE_NAME: &str = "auto-continue-claude.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("另一个实例正在运行 (PID: {pid})\n如果确认没有运行，请删除: {}", .path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("锁文件操作失败: {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// 持有中的单实例锁，drop 时自动释放
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    /// 默认锁文件路径
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(LOCK_FILE_NAME)
    }

    /// 获取锁
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let me = std::process::id();

        if path.exists() {
            match read_holder(&path) {
                Some(pid) if pid != me && process_alive(pid) => {
                    return Err(LockError::AlreadyRunning { pid, path });
                }
                holder => {
                    info!(path = %path.display(), holder = ?holder, "Removing stale lock file");
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            return Err(LockError::Io { path, source: e });
                        }
                    }
                }
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // 删除陈旧锁和重新创建之间被另一个实例抢先
                return match read_holder(&path) {
                    Some(pid) => Err(LockError::AlreadyRunning { pid, path }),
                    None => Err(LockError::Io { path, source: e }),
                };
            }
            Err(e) => return Err(LockError::Io { path, source: e }),
        };

        if let Err(e) = file.try_lock_exclusive() {
            warn!(path = %path.display(), error = %e, "Advisory lock unavailable, relying on PID record");
        }

        let written = write!(file, "{}", me).and_then(|_| file.flush());
        if let Err(source) = written {
            let _ = fs::remove_file(&path);
            return Err(LockError::Io { path, source });
        }

        debug!(path = %path.display(), pid = me, "Instance lock acquired");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 释放锁：只要文件存在就删除
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let _ = file.unlock();
        drop(file);

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Instance lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release instance lock");
        }
    }
}

/// 读取锁文件中的 PID
pub fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// 检查进程是否存在
pub fn process_alive(pid: u32) -> bool {
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    const DEAD_PID: u32 = u32::MAX - 1;

    #[test]
    fn test_acquire_fresh_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");

        let mut lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));

        lock.release().unwrap();
        assert!(!path.exists());
        // 重复释放无副作用
        lock.release().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        fs::write(&path, DEAD_PID.to_string()).unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));
    }

    #[test]
    fn test_unparsable_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        fs::write(&path, "not-a-pid").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));
    }

    #[test]
    fn test_live_holder_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, child.id().to_string()).unwrap();

        let result = InstanceLock::acquire(&path);
        let _ = child.kill();
        let _ = child.wait();

        match result {
            Err(LockError::AlreadyRunning { pid, .. }) => assert_eq!(pid, child.id()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        // 拒绝时不改动已有锁文件
        assert_eq!(read_holder(&path), Some(child.id()));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(DEAD_PID));
    }
}
