//! Plugin package archives
//!
//! A plugin package is a gzip-compressed tar archive (`.fpkg`) with
//! `manifest.json` at the root, an optional `signature.json`, and the
//! plugin's code and assets. All functions here are synchronous and
//! read-only except [`unpack`]; callers off the async path dispatch them via
//! `spawn_blocking`.

use crate::error::{PackageError, PluginError, PluginResult};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// Manifest entry name at the archive root
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Detached signature entry name at the archive root
pub const SIGNATURE_ENTRY: &str = "signature.json";

/// Extensions treated as script code for static scanning
pub const SCRIPT_EXTENSIONS: &[&str] = &["lua", "js"];

/// A file entry inside a package archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub path: String,
    pub size: u64,
}

impl PackageEntry {
    pub fn is_script(&self) -> bool {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| SCRIPT_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    }
}

fn open_archive(path: &Path) -> PluginResult<Archive<GzDecoder<File>>> {
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// Normalize an in-archive path, rejecting absolute paths and traversal
fn entry_rel_path(raw: &Path) -> Result<String, PackageError> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PackageError::Corrupt(format!(
                    "unsafe entry path: {}",
                    raw.display()
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(PackageError::Corrupt("empty entry path".to_string()));
    }
    Ok(normalized.to_string_lossy().into_owned())
}

/// Walk the archive, verifying it is structurally readable
///
/// Returns the file entries in archive order. Fails with
/// [`PackageError::Corrupt`] on any archive-format error, unsafe entry path,
/// or an archive with no file entries at all.
pub fn walk(path: &Path) -> PluginResult<Vec<PackageEntry>> {
    let mut archive = open_archive(path)?;
    let mut entries = Vec::new();

    let iter = archive
        .entries()
        .map_err(|e| PackageError::Corrupt(e.to_string()))?;

    for entry in iter {
        let entry = entry.map_err(|e| PackageError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry
            .path()
            .map_err(|e| PackageError::Corrupt(e.to_string()))?
            .into_owned();
        entries.push(PackageEntry {
            path: entry_rel_path(&raw)?,
            size: entry.size(),
        });
    }

    if entries.is_empty() {
        return Err(PackageError::Corrupt("archive has no file entries".to_string()).into());
    }

    Ok(entries)
}

/// Read one entry's bytes, capped at `max_bytes`
pub fn read_entry(path: &Path, name: &str, max_bytes: u64) -> PluginResult<Option<Vec<u8>>> {
    let mut archive = open_archive(path)?;
    let iter = archive
        .entries()
        .map_err(|e| PackageError::Corrupt(e.to_string()))?;

    for entry in iter {
        let mut entry = entry.map_err(|e| PackageError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry
            .path()
            .map_err(|e| PackageError::Corrupt(e.to_string()))?
            .into_owned();
        if entry_rel_path(&raw)? != name {
            continue;
        }
        if entry.size() > max_bytes {
            return Err(PackageError::TooLarge {
                actual: entry.size(),
                limit: max_bytes,
            }
            .into());
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| PackageError::Corrupt(e.to_string()))?;
        return Ok(Some(bytes));
    }

    Ok(None)
}

/// Read every script entry as UTF-8 text (lossy), each capped at `max_bytes`
pub fn read_scripts(path: &Path, max_bytes: u64) -> PluginResult<Vec<(String, String)>> {
    let mut archive = open_archive(path)?;
    let mut scripts = Vec::new();

    let iter = archive
        .entries()
        .map_err(|e| PackageError::Corrupt(e.to_string()))?;

    for entry in iter {
        let mut entry = entry.map_err(|e| PackageError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry
            .path()
            .map_err(|e| PackageError::Corrupt(e.to_string()))?
            .into_owned();
        let rel = entry_rel_path(&raw)?;
        let probe = PackageEntry {
            path: rel.clone(),
            size: entry.size(),
        };
        if !probe.is_script() {
            continue;
        }
        if entry.size() > max_bytes {
            return Err(PackageError::TooLarge {
                actual: entry.size(),
                limit: max_bytes,
            }
            .into());
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| PackageError::Corrupt(e.to_string()))?;
        scripts.push((rel, String::from_utf8_lossy(&bytes).into_owned()));
    }

    Ok(scripts)
}

/// Unpack the archive into `dest`
///
/// Entry paths are re-validated against traversal before anything is
/// written.
pub fn unpack(path: &Path, dest: &Path) -> PluginResult<()> {
    // Validates every entry path up front
    walk(path)?;

    std::fs::create_dir_all(dest)?;
    let mut archive = open_archive(path)?;
    archive
        .unpack(dest)
        .map_err(|e| PluginError::from(PackageError::Corrupt(e.to_string())))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walk_lists_file_entries() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("p.fpkg");
        test_fixtures::write_package(
            &pkg,
            &[
                (MANIFEST_ENTRY, b"{}".as_slice()),
                ("code/main.lua", b"return 1".as_slice()),
            ],
        );

        let entries = walk(&pkg).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "manifest.json");
        assert!(entries[1].is_script());
    }

    #[test]
    fn walk_rejects_non_archive() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("not-a-package.fpkg");
        std::fs::write(&bogus, b"plain text, not a tarball").unwrap();

        let err = walk(&bogus).unwrap_err();
        assert!(matches!(err, PluginError::Package(PackageError::Corrupt(_))));
    }

    #[test]
    fn walk_rejects_traversal_entries() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("evil.fpkg");
        test_fixtures::write_package(&pkg, &[("../escape.lua", b"boom".as_slice())]);

        let err = walk(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Package(PackageError::Corrupt(_))));
    }

    #[test]
    fn read_entry_finds_manifest() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("p.fpkg");
        test_fixtures::write_package(&pkg, &[(MANIFEST_ENTRY, b"{\"id\":\"x\"}".as_slice())]);

        let bytes = read_entry(&pkg, MANIFEST_ENTRY, 1024).unwrap().unwrap();
        assert_eq!(bytes, b"{\"id\":\"x\"}");

        assert!(read_entry(&pkg, "missing.json", 1024).unwrap().is_none());
    }

    #[test]
    fn unpack_writes_entries_to_dest() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("p.fpkg");
        test_fixtures::write_package(
            &pkg,
            &[
                (MANIFEST_ENTRY, b"{}".as_slice()),
                ("assets/icon.svg", b"<svg/>".as_slice()),
            ],
        );

        let dest = dir.path().join("unpacked");
        unpack(&pkg, &dest).unwrap();

        assert!(dest.join("manifest.json").is_file());
        assert!(dest.join("assets/icon.svg").is_file());
    }
}
