//! Deterministic ustar packaging.
//!
//! The same file set always yields the same bytes: entries sorted by path,
//! mtime 0, uid/gid 0, mode 0644, no owner names.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{Error, Result};

/// Files of an archive keyed by relative path.
pub type ArchiveFiles = BTreeMap<String, Vec<u8>>;

/// Packs `files` into a ustar archive.
///
/// # Errors
///
/// Returns `Error::Validation` for an absolute or traversing path, or
/// `Error::Storage` if the tar writer fails.
pub fn pack(files: &ArchiveFiles) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    for (path, data) in files {
        check_path(path)?;
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Reads every regular file of a ustar archive.
///
/// # Errors
///
/// Returns `Error::Serialization` for a malformed archive, a duplicate
/// path, or a path that escapes the archive root.
pub fn unpack(bytes: &[u8]) -> Result<ArchiveFiles> {
    let mut archive = tar::Archive::new(bytes);
    let mut files = ArchiveFiles::new();
    let entries = archive
        .entries()
        .map_err(|e| Error::Serialization(format!("archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Serialization(format!("archive entry: {e}")))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::Serialization(format!("archive path: {e}")))?
            .to_string_lossy()
            .into_owned();
        check_path(&path).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::Serialization(format!("reading {path}: {e}")))?;
        if files.insert(path.clone(), data).is_some() {
            return Err(Error::Serialization(format!("duplicate archive path {path}")));
        }
    }
    Ok(files)
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(Error::invalid(format!("unsafe archive path '{path}'")));
    }
    Ok(())
}
