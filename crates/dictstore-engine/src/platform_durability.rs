//! Durable sync and the store lock, per platform.
//!
//! `durable_sync` picks the strongest flush each OS offers. `StoreLock` is a
//! non-blocking advisory lock on the store's `LOCK` file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Flush `file`'s data to stable storage.
///
/// `fdatasync` on Linux, `F_FULLFSYNC` on Apple targets, `FlushFileBuffers`
/// on Windows and `sync_data` elsewhere. Can block for milliseconds.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference, so it is open for the duration of the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync() on Apple platforms stops at the drive's volatile cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference, so it is open for the duration of the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist a rename or unlink inside `dir`.
///
/// Directories cannot be opened as files on Windows; there the rename is
/// already durable once `MoveFileEx` returns, so this is a no-op.
pub fn sync_dir(dir: &Path) -> EngineResult<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)
            .map_err(|e| EngineError::io(dir, e, "Failed to open directory for sync"))?;
        durable_sync(&handle)
            .map_err(|e| EngineError::io(dir, e, "Failed to sync directory"))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Lock mode requested on a store's lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers may share the store
    Shared,
    /// One writer, no readers from other processes
    Exclusive,
}

/// A held advisory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `EngineError::Locked` if another process holds a conflicting lock.
    pub fn acquire(path: &Path, mode: LockMode) -> EngineResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| EngineError::io(path, e, "Failed to open lock file"))?;

        match try_lock(&file, mode) {
            Ok(()) => Ok(Self { file, path: path.to_path_buf(), mode }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(EngineError::Locked { path: path.to_path_buf() })
            }
            Err(e) => Err(EngineError::io(path, e, "Failed to lock store")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    // SAFETY: flock on a valid fd owned by `file`.
    let result = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, err))
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: flock on a valid fd owned by `file`.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

    let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
    if mode == LockMode::Exclusive {
        flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    // SAFETY: zeroed OVERLAPPED is the documented way to lock from offset 0.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    // SAFETY: the handle comes from a live File reference.
    let result = unsafe {
        LockFileEx(file.as_raw_handle() as *mut _, flags, 0, u32::MAX, u32::MAX, &mut overlapped)
    };
    if result != 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, err))
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn unlock(file: &File) {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::UnlockFile;
    // SAFETY: the handle comes from a live File reference.
    unsafe {
        UnlockFile(file.as_raw_handle() as *mut _, 0, 0, u32::MAX, u32::MAX);
    }
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &File) {}
