//! File I/O helpers: strict UTF-8 reads and atomic temp-file-then-rename writes.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use serde::Serialize;

use crate::core::errors::EngineError;

/// Read a file as UTF-8. Invalid UTF-8 is an error rather than a lossy
/// decode, so a later write can never silently mangle bytes.
pub fn read_text(path: &Path) -> Result<String, EngineError> {
    let bytes = fs::read(path).map_err(|e| EngineError::io("read", path, e))?;
    String::from_utf8(bytes).map_err(|e| {
        EngineError::io(
            "read",
            path,
            io::Error::new(io::ErrorKind::InvalidData, format!("not valid UTF-8: {e}")),
        )
    })
}

/// Stage `data` in a same-directory temp file with the destination's
/// permissions, fsync it, and return it ready to persist.
fn stage(path: &Path, data: &[u8]) -> io::Result<tempfile::NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut file = tmp.as_file();
        file.write_all(data)?;
        file.sync_all()?;
    }

    // Preserve original permissions when overwriting
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    Ok(tmp)
}

/// Atomically replace `path` with `data`. Readers see the old or the new
/// content, never a prefix.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    let tmp = stage(path, data).map_err(|e| EngineError::io("write", path, e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::io("write", path, e.error))?;
    if let Some(parent) = path.parent() {
        let _ = sync_dir(parent);
    }
    Ok(())
}

/// Atomically create `path` with `data` only if nothing exists there yet.
/// Returns `false` (and writes nothing) when the path is already taken.
pub fn write_new_atomic(path: &Path, data: &[u8]) -> Result<bool, EngineError> {
    let tmp = stage(path, data).map_err(|e| EngineError::io("write", path, e))?;
    match tmp.persist_noclobber(path) {
        Ok(_) => {
            if let Some(parent) = path.parent() {
                let _ = sync_dir(parent);
            }
            Ok(true)
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(EngineError::io("write", path, e.error)),
    }
}

/// Pretty JSON, written atomically; creates the parent directory.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), EngineError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| EngineError::io("create dir", parent, e))?;
    }
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::State(format!("serialize {}: {e}", path.display())))?;
    write_atomic(path, text.as_bytes())
}

/// Cross-platform directory fsync helper.
#[cfg(unix)]
pub fn sync_dir(p: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(windows)]
pub fn sync_dir(_p: &Path) -> io::Result<()> {
    // Windows does not expose a reliable directory fsync; best-effort no-op.
    Ok(())
}
