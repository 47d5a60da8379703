use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 单实例锁
///
/// 持有锁文件上的独占锁，释放（drop）时解锁。
/// 同一锁文件上只能有一个运行中的主机。
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// 非阻塞地获取锁；已被其他实例持有时返回错误
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock file directory {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                bail!(
                    "Another instance is already running (lock file {})",
                    path.display()
                )
            }
            Err(TryLockError::Error(e)) => {
                return Err(e)
                    .with_context(|| format!("Failed to lock {}", path.display()));
            }
        }

        info!("Instance lock acquired. LockFile: {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("tunnel-core-lock-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let path = temp_lock_path("host.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("Another instance is already running"));

        drop(first);
        let again = InstanceLock::acquire(&path).unwrap();
        drop(again);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
