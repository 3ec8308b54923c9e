//! Sysfs and small-file I/O
//!
//! Covers the read/write half of the kernel interface: sized and
//! grow-until-EOF loads, plain and atomic writes, and a cached writer that
//! skips writes whose payload matches the last one (flash-wear rule for the
//! backlight node).

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SysfsError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} does not contain a number: {content:?}")]
    NotANumber { path: PathBuf, content: String },
}

type Result<T> = std::result::Result<T, SysfsError>;

fn io_err(path: &Path, source: std::io::Error) -> SysfsError {
    SysfsError::Io { path: path.to_path_buf(), source }
}

/// Read a file whose size `stat` reports correctly.
///
/// Partial reads are tolerated by looping; `EINTR` restarts the read.
pub fn load_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let size = file.metadata().map_err(|e| io_err(path, e))?.len() as usize;
    let mut buf = vec![0u8; size];
    let mut at = 0;
    while at < buf.len() {
        match file.read(&mut buf[at..]) {
            Ok(0) => break,
            Ok(n) => at += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(path, e)),
        }
    }
    buf.truncate(at);
    Ok(buf)
}

/// Read a pseudo-file that reports zero size by growing a buffer until EOF.
pub fn load_until_eof(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(path, e)),
        }
    }
    Ok(buf)
}

/// Read a whitespace-trimmed decimal number.
pub fn load_number(path: &Path) -> Result<i64> {
    let raw = load_until_eof(path)?;
    let text = String::from_utf8_lossy(&raw);
    let trimmed = text.trim();
    trimmed.parse().map_err(|_| SysfsError::NotANumber {
        path: path.to_path_buf(),
        content: trimmed.to_string(),
    })
}

/// Plain whole-file write (create or truncate).
pub fn write_string(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.write_all(value.as_bytes()).map_err(|e| io_err(path, e))
}

/// Decimal write, as sysfs attributes expect.
pub fn write_number(path: &Path, value: i64) -> Result<()> {
    let mut buf = [0u8; 24];
    let mut cursor = std::io::Cursor::new(&mut buf[..]);
    // i64 always fits in 24 bytes.
    let _ = write!(cursor, "{value}");
    let len = cursor.position() as usize;
    let s = std::str::from_utf8(&buf[..len]).unwrap_or("0");
    write_string(path, s)
}

/// Atomic whole-file replace: write `path.tmp`, fsync, rename over target.
///
/// With `keep_backup` the previous content survives as a `path.bak`
/// hardlink.
pub fn write_atomic(path: &Path, data: &[u8], keep_backup: bool) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(data).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    if keep_backup && path.exists() {
        let bak = path.with_extension("bak");
        let _ = fs::remove_file(&bak);
        if let Err(e) = fs::hard_link(path, &bak) {
            warn!(path = %path.display(), error = %e, "backup hardlink failed");
        }
    }
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

/// Atomic replace that first compares and skips identical content, so
/// repeated saves do not wear flash.
pub fn update_file_atomic(path: &Path, data: &[u8], keep_backup: bool) -> Result<bool> {
    if let Ok(current) = load_file(path) {
        if current == data {
            return Ok(false);
        }
    }
    write_atomic(path, data, keep_backup)?;
    Ok(true)
}

/// A writable sysfs attribute with a last-written cache.
///
/// `set()` skips the kernel write when the value matches the cache;
/// `set_forced()` always writes. The cache starts out unknown so the first
/// `set()` always reaches the node.
#[derive(Debug)]
pub struct SysfsFile {
    path: PathBuf,
    last: Option<i64>,
}

impl SysfsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, last: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last value successfully handed to the kernel, if any.
    pub fn cached(&self) -> Option<i64> {
        self.last
    }

    /// Write `value` unless it matches the cache. Returns whether a kernel
    /// write happened. Failures log at warn and leave the cache untouched.
    pub fn set(&mut self, value: i64) -> bool {
        if self.last == Some(value) {
            return false;
        }
        self.set_forced(value)
    }

    /// Write unconditionally, bypassing the cache comparison.
    pub fn set_forced(&mut self, value: i64) -> bool {
        match write_number(&self.path, value) {
            Ok(()) => {
                self.last = Some(value);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), value, error = %e, "sysfs write failed");
                false
            }
        }
    }

    /// Drop the cache so the next `set()` writes regardless.
    pub fn invalidate(&mut self) {
        debug!(path = %self.path.display(), "sysfs write cache invalidated");
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        fs::write(&p, b"hello\n").unwrap();
        assert_eq!(load_file(&p).unwrap(), b"hello\n");
        assert_eq!(load_until_eof(&p).unwrap(), b"hello\n");
    }

    #[test]
    fn load_number_trims() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("n");
        fs::write(&p, "  255\n").unwrap();
        assert_eq!(load_number(&p).unwrap(), 255);
        fs::write(&p, "not a number").unwrap();
        assert!(matches!(load_number(&p), Err(SysfsError::NotANumber { .. })));
    }

    #[test]
    fn atomic_write_replaces_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cfg");
        write_atomic(&p, b"one", false).unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"one");
        write_atomic(&p, b"two", true).unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"two");
        assert_eq!(fs::read(p.with_extension("bak")).unwrap(), b"one");
        assert!(!p.with_extension("tmp").exists());
    }

    #[test]
    fn update_skips_identical() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cfg");
        assert!(update_file_atomic(&p, b"same", false).unwrap());
        assert!(!update_file_atomic(&p, b"same", false).unwrap());
        assert!(update_file_atomic(&p, b"changed", false).unwrap());
    }

    #[test]
    fn cached_writer_skips_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("brightness");
        let mut node = SysfsFile::new(p.clone());
        assert!(node.set(40));
        assert!(!node.set(40));
        assert_eq!(fs::read_to_string(&p).unwrap(), "40");
        assert!(node.set(41));
        assert_eq!(fs::read_to_string(&p).unwrap(), "41");
    }

    #[test]
    fn forced_write_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("brightness");
        let mut node = SysfsFile::new(p.clone());
        node.set(10);
        fs::write(&p, "0").unwrap(); // someone else clobbered the node
        assert!(node.set_forced(10));
        assert_eq!(fs::read_to_string(&p).unwrap(), "10");
    }
}
