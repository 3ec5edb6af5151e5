//! Advisory file locking and atomic writes shared by every append-only log
//! and snapshot writer in the crate.
//!
//! The lock half wraps POSIX `flock`; the atomic-write half writes to a
//! temp file in the same directory and renames it into place, so readers
//! never observe a partial write.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

/// An exclusive advisory lock held on a sidecar `.lock` file next to the
/// protected path. Dropping the guard releases the lock, so every exit path
/// (including early returns via `?`) releases it.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquires an exclusive advisory lock for `path`, blocking until available.
/// The lock file is `{path}.lock`, created if missing; the directory is
/// created if missing.
pub fn exclusive_lock(path: &Path) -> io::Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock_path = lock_path_for(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    FileExt::lock_exclusive(&file)?;
    Ok(LockGuard { file })
}

fn lock_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Writes `contents` to `path` atomically: write to a sibling temp file then
/// rename over the destination. Readers never observe a partially written
/// file. Does not itself acquire a lock — callers serialize concurrent
/// writers to the same path via [`exclusive_lock`] when more than one writer
/// is possible.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Appends `line` (with a trailing newline) to `path` under an exclusive
/// lock, creating the file if needed. Used for every JSONL append-only log.
pub fn append_line_locked(path: &Path, line: &str) -> io::Result<()> {
    use std::io::Write;
    let _guard = exclusive_lock(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn atomic_write_never_leaves_a_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "{\"a\":1}");
        assert!(!dir.path().join("snapshot.json.tmp").exists());
    }

    #[test]
    fn append_line_locked_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line_locked(&path, "{\"n\":1}").unwrap();
        append_line_locked(&path, "{\"n\":2}").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        {
            let _guard = exclusive_lock(&path).unwrap();
        }
        let _guard_again = exclusive_lock(&path).unwrap();
    }
}
