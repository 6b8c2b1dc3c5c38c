//! Host-wide guard that lets only one process serve a channel prefix.
//!
//! Every IOC takes an exclusive `flock` on `<lock_dir>/<prefix>.lock` before it
//! binds. The kernel drops the lock when the process exits, so a crashed IOC
//! never leaves a stale lock behind.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::{ConfigError, IocError};

/// File name of the lock guarding `prefix`. `:` becomes `.`; any other byte that
/// is not alphanumeric, `-` or `_` is hex escaped, so distinct prefixes never share a lock.
pub fn lock_file_name(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::from("default.lock");
    }
    let mut stem = String::with_capacity(prefix.len());
    for byte in prefix.bytes() {
        match byte {
            b':' => stem.push('.'),
            b'-' | b'_' => stem.push(byte as char),
            b if b.is_ascii_alphanumeric() => stem.push(b as char),
            b => stem.push_str(&format!("%{b:02X}")),
        }
    }
    format!("{stem}.lock")
}

/// Held for as long as the IOC serves its prefix; dropping it releases the lock
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    _file: File,
}

impl InstanceLock {
    /// Take the lock of `prefix` in `dir`, creating the directory if needed.
    ///
    /// Fails with `IocError::AlreadyRunning` when another process (or another
    /// IOC in this process) holds it, and with a `ConfigError` when the lock
    /// cannot be taken at all.
    pub fn acquire(dir: &Path, prefix: &str) -> Result<Self, IocError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            ConfigError::Invalid(format!("lock_dir {} is not usable: {e}", dir.display()))
        })?;
        let path = dir.join(lock_file_name(prefix));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                ConfigError::Invalid(format!("lock file {} cannot be opened: {e}", path.display()))
            })?;
        let locked = try_lock_exclusive(&file).map_err(|e| {
            ConfigError::Invalid(format!("lock file {} cannot be locked: {e}", path.display()))
        })?;
        if !locked {
            return Err(IocError::AlreadyRunning);
        }
        // Only informative; the flock is the guard
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "instance locks need flock",
    ))
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_file_names() {
        assert_eq!(lock_file_name("SI-Glob:AP-SOFB:"), "SI-Glob.AP-SOFB..lock");
        assert_eq!(lock_file_name("SI-10SB:ID-EPU50:"), "SI-10SB.ID-EPU50..lock");
        assert_eq!(lock_file_name("a/b"), "a%2Fb.lock");
        assert_eq!(lock_file_name(""), "default.lock");
        assert_ne!(lock_file_name("A:B"), lock_file_name("A_B"));
    }

    #[test]
    fn test_second_lock_on_same_prefix_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path(), "SI-Glob:AP-SOFB:").unwrap();
        assert!(matches!(
            InstanceLock::acquire(dir.path(), "SI-Glob:AP-SOFB:"),
            Err(IocError::AlreadyRunning)
        ));
        // Another prefix is independent
        let other = InstanceLock::acquire(dir.path(), "BO-Glob:AP-SOFB:").unwrap();
        assert_ne!(first.path(), other.path());

        let pid = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        drop(first);
        assert!(InstanceLock::acquire(dir.path(), "SI-Glob:AP-SOFB:").is_ok());
    }

    #[test]
    fn test_unusable_lock_dir_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, "x").unwrap();
        assert!(matches!(
            InstanceLock::acquire(&not_a_dir, "SI-Glob:AP-SOFB:"),
            Err(IocError::ConfigError(_))
        ));
    }
}
