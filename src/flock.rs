//! Advisory lock on a tablet server's data directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive `flock` held for as long as the value lives. The lock file
/// records the owning process id.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take the lock without blocking; fails if another process (or another
    /// `FileLock` in this one) holds it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_records_pid() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tabletstore.lock");

        let lock = FileLock::lock(&path)?;
        assert_eq!(lock.path(), path.as_path());
        let content = fs::read_to_string(&path)?;
        assert_eq!(content.trim(), std::process::id().to_string());
        Ok(())
    }

    #[test]
    fn test_second_lock_fails_until_drop() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tabletstore.lock");

        let first = FileLock::lock(&path)?;
        assert!(FileLock::lock(&path).is_err());

        drop(first);
        let _second = FileLock::lock(&path)?;
        Ok(())
    }
}
