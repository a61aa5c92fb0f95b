//! Crash-safe replacement of small state files (pid file, daemon state).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `content` via a synced sibling temp file and a rename,
/// so a reader sees either the old or the new content.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("destination '{}' has no file name", path.display());
    };
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let temp_path = sibling_temp_path(dir, file_name);
    let result = write_synced(&temp_path, content).and_then(|()| {
        std::fs::rename(&temp_path, path).with_context(|| {
            format!("failed to move {} into place at {}", temp_path.display(), path.display())
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn sibling_temp_path(dir: &Path, file_name: &str) -> PathBuf {
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        ".{file_name}.{}.{}.{sequence}.tmp",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}

fn write_synced(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))
}
