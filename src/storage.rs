//! Durable local writes.
//!
//! Every piece of persisted state (progress documents, the retry ledger,
//! cached index data, downloaded captures) goes through [`write_atomic`], so a
//! crash mid-write leaves either the old file or the new one, never a torn
//! one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tracing::debug!(dir = %parent.display(), "creating directory");
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write `contents` to a sibling temp file, fsync it, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })?;
    // Make the rename itself durable.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
