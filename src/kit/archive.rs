//! Kit archive extraction (§4.A, §6 "Kit archive format").
//!
//! Supports `tar.gz` and `zip`, top-level either a single directory
//! containing `kit.yaml` or the manifest at the root. Every entry is
//! path-traversal checked before being written: a component-walk guard
//! rather than trusting the archive's own paths.

use crate::error::{CoreError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Extracts an archive's contents into `dest`, which must not yet exist.
/// Detects format by sniffing the first bytes rather than trusting a file
/// extension, since uploads arrive as an opaque byte stream.
pub fn extract(archive_bytes: &[u8], dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(CoreError::MalformedKit(format!(
            "extraction destination {dest:?} already exists"
        )));
    }
    fs::create_dir_all(dest)
        .map_err(|e| CoreError::MalformedKit(format!("failed to create {dest:?}: {e}")))?;

    let result = extract_into_existing_dir(archive_bytes, dest);
    if result.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    result?;
    strip_single_top_level_dir(dest)?;
    Ok(())
}

/// Same as [`extract`] but `dest` must already exist — used to unpack a
/// workspace seed into a workspace root the Workspace Store has already
/// created (§4.C "zips the kit's `workspace/` seed ... delegates to the
/// Workspace Store for materialization").
pub fn extract_into_existing_dir(archive_bytes: &[u8], dest: &Path) -> Result<()> {
    if is_gzip(archive_bytes) {
        extract_tar_gz(archive_bytes, dest)
    } else if is_zip(archive_bytes) {
        extract_zip(archive_bytes, dest)
    } else {
        Err(CoreError::MalformedKit(
            "archive is neither gzip nor zip".into(),
        ))
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn is_zip(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..4] == b"PK\x03\x04"
}

/// Rejects `..`, absolute paths, and anything else that could escape
/// `dest` once joined.
fn safe_relative_path(dest: &Path, raw: &Path) -> Result<PathBuf> {
    for component in raw.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            other => {
                return Err(CoreError::InvalidPath(format!(
                    "archive entry {raw:?} contains disallowed path component {other:?}"
                )))
            }
        }
    }
    let joined = dest.join(raw);
    let canonical_dest = dest
        .canonicalize()
        .map_err(|e| CoreError::InvalidPath(format!("{dest:?}: {e}")))?;
    let parent = joined.parent().unwrap_or(dest).to_path_buf();
    fs::create_dir_all(&parent)
        .map_err(|e| CoreError::MalformedKit(format!("failed to create {parent:?}: {e}")))?;
    let canonical_parent = parent
        .canonicalize()
        .map_err(|e| CoreError::InvalidPath(format!("{parent:?}: {e}")))?;
    if !canonical_parent.starts_with(&canonical_dest) {
        return Err(CoreError::InvalidPath(format!(
            "archive entry {raw:?} escapes extraction root"
        )));
    }
    Ok(joined)
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| CoreError::MalformedKit(format!("invalid tar stream: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::MalformedKit(e.to_string()))?;
        let raw_path = entry
            .path()
            .map_err(|e| CoreError::MalformedKit(e.to_string()))?
            .into_owned();
        if entry.header().entry_type().is_dir() {
            let target = safe_relative_path(dest, &raw_path)?;
            fs::create_dir_all(&target)
                .map_err(|e| CoreError::MalformedKit(format!("{target:?}: {e}")))?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let target = safe_relative_path(dest, &raw_path)?;
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| CoreError::MalformedKit(e.to_string()))?;
        fs::write(&target, buf).map_err(|e| CoreError::MalformedKit(format!("{target:?}: {e}")))?;
    }
    Ok(())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| CoreError::MalformedKit(e.to_string()))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| CoreError::MalformedKit(e.to_string()))?;
        let raw_path = match file.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(CoreError::InvalidPath(format!(
                    "zip entry {:?} is not a safe relative path",
                    file.name()
                )))
            }
        };
        if file.is_dir() {
            let target = safe_relative_path(dest, &raw_path)?;
            fs::create_dir_all(&target)
                .map_err(|e| CoreError::MalformedKit(format!("{target:?}: {e}")))?;
            continue;
        }
        let target = safe_relative_path(dest, &raw_path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| CoreError::MalformedKit(e.to_string()))?;
        fs::write(&target, buf).map_err(|e| CoreError::MalformedKit(format!("{target:?}: {e}")))?;
    }
    Ok(())
}

/// If every extracted top-level entry lives under a single directory (the
/// common "repo-main/" archive shape), flatten it so `dest` directly
/// contains `kit.yaml`, `actions/`, etc.
fn strip_single_top_level_dir(dest: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dest)
        .map_err(|e| CoreError::MalformedKit(e.to_string()))?
        .filter_map(|e| e.ok())
        .collect();
    if entries.len() != 1 || !entries[0].path().is_dir() {
        return Ok(());
    }
    let inner = entries[0].path();
    if !inner.join("kit.yaml").is_file() {
        return Ok(());
    }
    let names: BTreeSet<_> = fs::read_dir(&inner)
        .map_err(|e| CoreError::MalformedKit(e.to_string()))?
        .filter_map(|e| e.ok().map(|e| e.file_name()))
        .collect();
    for name in names {
        fs::rename(inner.join(&name), dest.join(&name))
            .map_err(|e| CoreError::MalformedKit(format!("flattening archive root: {e}")))?;
    }
    fs::remove_dir(&inner).map_err(|e| CoreError::MalformedKit(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_path_traversal_in_zip_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
            writer.start_file("../escape.txt", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }
        let dest = dir.path().join("kit");
        let result = extract(&buf, &dest);
        assert!(result.is_err());
    }
}
