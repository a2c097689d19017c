//! Platform-specific durable sync
//!
//! Flushed records and compaction rewrites are only safe once they reach
//! physical media. Each platform gets the strongest primitive it offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until `file`'s data is on persistent storage.
///
/// - Linux: `fdatasync()`; the log's metadata (mtime) is not needed for recovery
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain fsync stops at the drive cache
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// May block for a long time under heavy I/O. The flush loop calls this
/// outside the index gate so readers keep going.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the call.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result != -1 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File`.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
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

/// Persist directory entries (renames, creations, removals) in `dir`.
///
/// Directories cannot be opened for sync on Windows; NTFS journals the
/// metadata itself, so this is a no-op there.
pub fn durable_sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
