//! File-system helpers shared by the file-backed store, lock manager and
//! rate limiter.
//!
//! Every write goes to a temp file in the target directory first, then is
//! renamed into place, so readers only ever see complete records.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::domain::CoreError;

/// Runs blocking file work off the async executor.
pub(crate) async fn blocking<T, F>(context: &'static str, f: F) -> Result<T, CoreError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::backend(context, io::Error::other(e.to_string())))?
}

/// Opens `path` and takes an exclusive advisory lock on it. The lock is
/// released when the returned file is dropped.
pub(crate) fn lock_file(path: &Path) -> Result<File, CoreError> {
    let file = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| CoreError::backend(format!("open {}", path.display()), e))?;
    fs2::FileExt::lock_exclusive(&file)
        .map_err(|e| CoreError::backend(format!("lock {}", path.display()), e))?;
    Ok(file)
}

fn staged<T: Serialize>(path: &Path, value: &T) -> Result<NamedTempFile, CoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let backend = |e: io::Error| CoreError::backend(format!("stage {}", path.display()), e);

    let mut tmp = NamedTempFile::new_in(dir).map_err(backend)?;
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| CoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(&bytes).map_err(backend)?;
    tmp.as_file().sync_all().map_err(backend)?;
    Ok(tmp)
}

/// Writes `value` to `path` only if nothing is there yet. Returns `false`
/// when the path already exists; the check and the create are one rename.
pub(crate) fn write_new<T: Serialize>(path: &Path, value: &T) -> Result<bool, CoreError> {
    let tmp = staged(path, value)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(CoreError::backend(
            format!("create {}", path.display()),
            e.error,
        )),
    }
}

/// Atomically replaces the content of `path`.
pub(crate) fn write_replace<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let tmp = staged(path, value)?;
    tmp.persist(path)
        .map_err(|e| CoreError::backend(format!("replace {}", path.display()), e.error))?;
    Ok(())
}

/// Reads a JSON record. A missing file is `Ok(None)`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::backend(format!("read {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Files in `dir` with the given extension, sorted by name. Temp files
/// never match because they carry no extension.
pub(crate) fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, CoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::backend(format!("list {}", dir.display()), e)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| CoreError::backend(format!("list {}", dir.display()), e))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(dir).map_err(|e| CoreError::backend(format!("create {}", dir.display()), e))
}
