//! Owner-only file persistence helpers shared by the store, session, and audit log.

use crate::error::{KeygateError, KeygateResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Minimum master key length in raw bytes.
pub const MASTER_KEY_MIN_LEN: usize = 32;

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

/// Create `dir` (and missing parents) readable only by the owner.
pub fn ensure_private_dir(dir: &Path) -> KeygateResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> KeygateResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_private_dir(parent),
        _ => Ok(()),
    }
}

/// Replace `path` with `contents`, owner-only.
pub fn write_private_file(path: &Path, contents: &[u8]) -> KeygateResult<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    Ok(())
}

/// Append `contents` to `path`, creating it owner-only if absent.
pub fn append_private_file(path: &Path, contents: &[u8]) -> KeygateResult<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Write `contents` to a sibling temp file and rename it over `path`, so
/// readers see either the old file or the new one.
pub fn atomic_replace(path: &Path, contents: &[u8]) -> KeygateResult<()> {
    ensure_parent(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(FILE_MODE))?;
    tmp.persist(path).map_err(|err| KeygateError::Io(err.error))?;
    Ok(())
}

/// Read and decode the base64 master key at `path`.
pub fn read_master_key(path: &Path) -> KeygateResult<Zeroizing<Vec<u8>>> {
    let contents = Zeroizing::new(fs::read_to_string(path)?);
    decode_master_key(path, &contents)
}

/// Decode one line of base64 into master key bytes.
pub fn decode_master_key(origin: &Path, text: &str) -> KeygateResult<Zeroizing<Vec<u8>>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(invalid_master_key(origin, "file is empty"));
    }
    if trimmed.lines().count() != 1 {
        return Err(invalid_master_key(origin, "expected a single line"));
    }

    let key = STANDARD
        .decode(trimmed)
        .map_err(|err| invalid_master_key(origin, format!("base64 decode failed: {err}")))?;

    if key.len() < MASTER_KEY_MIN_LEN {
        return Err(invalid_master_key(
            origin,
            format!(
                "master key must be at least {MASTER_KEY_MIN_LEN} bytes (got {})",
                key.len()
            ),
        ));
    }

    Ok(Zeroizing::new(key))
}

/// Persist `key` as a single base64 line with owner-only permissions.
pub fn write_master_key(path: &Path, key: &[u8]) -> KeygateResult<()> {
    let mut line = Zeroizing::new(STANDARD.encode(key));
    line.push('\n');
    write_private_file(path, line.as_bytes())
}

fn invalid_master_key(path: &Path, reason: impl Into<String>) -> KeygateError {
    KeygateError::InvalidMasterKey {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
