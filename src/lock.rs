//! File locking and atomic JSON documents
//!
//! Every file under `.stagewise/` is written whole: serialize, write a temp
//! file next to the target, rename. Writers hold an `fs2` lock on
//! `<file>.lock` so two processes sharing a planner directory (or a
//! directory remote) never interleave a read-modify-write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

const LOCK_RETRY_INTERVAL_MS: u64 = 25;

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // Windows reports sharing violations instead of WouldBlock.
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

/// Exclusive lock guard, released on drop
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, waiting up to `timeout_ms`.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;
        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if is_lock_contended(&err) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_INTERVAL_MS));
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// `Ok(None)` when another holder has the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if is_lock_contended(&err) => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// `<path>.lock`
pub fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

/// Write `data` to a sibling temp file and rename it over `path`.
///
/// Does not lock; see [`write_json_locked`].
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension(format!(
        "{}.tmp.{}",
        path.extension().and_then(|ext| ext.to_str()).unwrap_or(""),
        std::process::id()
    ));
    let mut temp = File::create(&temp_path)?;
    temp.write_all(data)?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically under the
/// file's lock.
pub fn write_json_locked<T: Serialize>(path: &Path, value: &T, timeout_ms: u64) -> Result<()> {
    let _lock = FileLock::acquire(lock_path_for(path), timeout_ms)?;
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Read a JSON document under the file's lock. A missing file yields `None`.
pub fn read_json_locked<T: DeserializeOwned>(path: &Path, timeout_ms: u64) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let _lock = FileLock::acquire(lock_path_for(path), timeout_ms)?;
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&content)?))
}

/// Read-modify-write a JSON document while holding its lock.
pub fn update_json_locked<T, R>(
    path: &Path,
    timeout_ms: u64,
    update: impl FnOnce(Option<T>) -> Result<(Option<T>, R)>,
) -> Result<R>
where
    T: Serialize + DeserializeOwned,
{
    let _lock = FileLock::acquire(lock_path_for(path), timeout_ms)?;
    let current = if path.exists() {
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&content)?)
        }
    } else {
        None
    };

    let (next, result) = update(current)?;
    match next {
        Some(value) => {
            let json = serde_json::to_vec_pretty(&value)?;
            write_atomic(path, &json)?;
        }
        None => {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CacheSnapshot;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let temp = TempDir::new().expect("tempdir");
        let lock_path = temp.path().join("cache.json.lock");

        let lock = FileLock::acquire(&lock_path, 1000).expect("acquire");
        assert!(FileLock::try_acquire(&lock_path).expect("try").is_none());
        assert!(matches!(
            FileLock::acquire(&lock_path, 30),
            Err(Error::LockFailed(_))
        ));

        drop(lock);
        assert!(FileLock::try_acquire(&lock_path).expect("try").is_some());
    }

    #[test]
    fn json_documents_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("nested").join("cache.json");

        let missing: Option<CacheSnapshot> = read_json_locked(&path, 1000).expect("read");
        assert!(missing.is_none());

        write_json_locked(&path, &CacheSnapshot::default(), 1000).expect("write");
        let loaded: Option<CacheSnapshot> = read_json_locked(&path, 1000).expect("read");
        assert_eq!(loaded, Some(CacheSnapshot::default()));
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn update_can_delete_the_document() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("counter.json");

        let seen = update_json_locked::<u32, _>(&path, 1000, |current| Ok((Some(current.unwrap_or(0) + 1), current)))
            .expect("update");
        assert_eq!(seen, None);
        let seen = update_json_locked::<u32, _>(&path, 1000, |current| Ok((None, current))).expect("update");
        assert_eq!(seen, Some(1));
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_writers_leave_one_whole_document() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("remote.json");
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|writer| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let payload = vec![writer; 64];
                    write_json_locked(&path, &payload, 2000).expect("write");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let final_value: Option<Vec<usize>> = read_json_locked(&path, 1000).expect("read");
        let values = final_value.expect("document");
        assert_eq!(values.len(), 64);
        assert!(values.iter().all(|value| *value == values[0]));
    }
}
