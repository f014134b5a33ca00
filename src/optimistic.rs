use crate::file::sha1_hex;
use anyhow::Context;
use anyhow::Result;
use lazy_static::lazy_static;
use nanoid::nanoid;
use std::collections::HashMap;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;

/// What a path points at, as far as resolution cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

struct ReadEntry {
    mtime: Option<SystemTime>,
    data: Arc<Vec<u8>>,
}

lazy_static! {
    static ref READ_CACHE: Mutex<HashMap<PathBuf, ReadEntry>> = Mutex::new(HashMap::new());
    static ref REALPATH_CACHE: Mutex<HashMap<PathBuf, Option<PathBuf>>> =
        Mutex::new(HashMap::new());
}

fn mtime_or_none(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Reads a file, reusing the cached contents while the mtime is unchanged.
pub fn read_file(path: &Path) -> Result<Arc<Vec<u8>>> {
    let mtime = mtime_or_none(path);
    {
        let cache = READ_CACHE.lock().unwrap();
        if let Some(entry) = cache.get(path) {
            if entry.mtime.is_some() && entry.mtime == mtime {
                return Ok(entry.data.clone());
            }
        }
    }

    let data = Arc::new(
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
    );
    READ_CACHE.lock().unwrap().insert(
        path.to_path_buf(),
        ReadEntry {
            mtime,
            data: data.clone(),
        },
    );
    Ok(data)
}

pub fn stat_or_null(path: &Path) -> Option<FileKind> {
    let meta = fs::metadata(path).ok()?;
    if meta.is_file() {
        Some(FileKind::File)
    } else if meta.is_dir() {
        Some(FileKind::Dir)
    } else {
        None
    }
}

/// Like stat_or_null but does not follow a trailing symlink.
pub fn lstat_is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

pub fn realpath_or_null(path: &Path) -> Option<PathBuf> {
    {
        let cache = REALPATH_CACHE.lock().unwrap();
        if let Some(real) = cache.get(path) {
            return real.clone();
        }
    }
    let real = fs::canonicalize(path).ok();
    REALPATH_CACHE
        .lock()
        .unwrap()
        .insert(path.to_path_buf(), real.clone());
    real
}

pub fn hash_or_null(path: &Path) -> Option<String> {
    read_file(path).ok().map(|data| sha1_hex(&data))
}

/// Writes via a temporary sibling and a rename, so a crash mid-write
/// never leaves a torn file behind.
pub fn write_file_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        nanoid!(10)
    ));
    fs::write(&tmp, data).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))?;

    // The cache entry for the destination is stale now.
    READ_CACHE.lock().unwrap().remove(path);
    Ok(())
}

fn under_node_modules(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == "node_modules"))
}

/// A path is linked when resolving its symlinks lands somewhere else.
pub fn is_linked(path: &Path) -> bool {
    match realpath_or_null(path) {
        Some(real) => real != path,
        None => false,
    }
}

/// Policy gate for the watch set: everything outside node_modules is
/// watched, and inside node_modules only linked packages are.
pub fn should_watch(path: &Path) -> bool {
    !under_node_modules(path) || is_linked(path)
}
