//! Tar framing for directory transfers
//!
//! Archives are classic ustar without compression. Packing follows symlinks
//! so archive contents never reference paths outside the archived tree;
//! unpacking rejects link entries and parent-directory components outright.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors from tar packing and extraction
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Underlying I/O failure
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive contains a symlink or hardlink entry
    #[error("archive entry {path} is a link; link entries are not extracted")]
    LinkEntry { path: String },

    /// An entry path would escape the extraction root
    #[error("archive entry {path} escapes the extraction root")]
    PathEscape { path: String },

    /// Background archive task failed
    #[error("archive task failed: {reason}")]
    Task { reason: String },
}

/// Pack the contents of `dir` into a tar archive.
///
/// Entry paths are relative to `dir`. Symlinks are followed, so the archive
/// carries the link targets' contents. File permissions are preserved.
pub async fn pack_dir(dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(true);
        builder.append_dir_all(".", &dir)?;
        Ok(builder.into_inner()?)
    })
    .await
    .map_err(|e| ArchiveError::Task {
        reason: e.to_string(),
    })?
}

/// Extract a tar archive into `target`, which must already exist.
///
/// Entries are validated before anything is written: link entries and paths
/// with parent-directory components fail the whole extraction.
pub async fn unpack_archive(data: Vec<u8>, target: &Path) -> Result<(), ArchiveError> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(data, &target))
        .await
        .map_err(|e| ArchiveError::Task {
            reason: e.to_string(),
        })?
}

fn unpack_blocking(data: Vec<u8>, target: &Path) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        match entry.header().entry_type() {
            tar::EntryType::Symlink | tar::EntryType::Link => {
                return Err(ArchiveError::LinkEntry {
                    path: path.display().to_string(),
                });
            }
            _ => {}
        }
        if escapes_root(&path) {
            return Err(ArchiveError::PathEscape {
                path: path.display().to_string(),
            });
        }

        entry.unpack_in(target)?;
    }
    Ok(())
}

fn escapes_root(path: &Path) -> bool {
    path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_pack_unpack_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub/deeper")).unwrap();
        fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        fs::write(src.path().join("sub/b.bin"), vec![0u8, 1, 2, 255]).unwrap();
        fs::write(src.path().join("sub/deeper/c"), b"").unwrap();

        let data = pack_dir(src.path()).await.unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack_archive(data, dst.path()).await.unwrap();

        assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(dst.path().join("sub/b.bin")).unwrap(),
            vec![0u8, 1, 2, 255]
        );
        assert!(dst.path().join("sub/deeper/c").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let data = pack_dir(src.path()).await.unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_archive(data, dst.path()).await.unwrap();

        let mode = fs::metadata(dst.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pack_follows_symlinks() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("real.txt"), b"content").unwrap();
        std::os::unix::fs::symlink(src.path().join("real.txt"), src.path().join("link.txt"))
            .unwrap();

        let data = pack_dir(src.path()).await.unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_archive(data, dst.path()).await.unwrap();

        // The link was materialized as a regular file
        let meta = fs::symlink_metadata(dst.path().join("link.txt")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read(dst.path().join("link.txt")).unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_unpack_rejects_symlink_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "innocent", "/etc/passwd")
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack_archive(data, dst.path()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::LinkEntry { .. }));
    }

    #[tokio::test]
    async fn test_unpack_rejects_parent_paths() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(4);
        header.set_cksum();
        builder
            .append_data(&mut header, "../evil", &b"boom"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack_archive(data, dst.path()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::PathEscape { .. }));
    }
}
