// 📦 Archiver - move committed documents into a sibling processed/ directory
//
// Name: <type>_<YYYY-MM>_<hash8>.<ext>. Only called after a successful
// commit, so a failure here leaves durable data behind a file that is still
// in its inbox; the next run re-archives it.

use crate::error::ArchiveFailure;
use crate::extract::DocumentType;
use crate::fingerprint::{fingerprint_file, Fingerprint};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn archive_name(
    document_type: DocumentType,
    period: &str,
    fingerprint: &Fingerprint,
    original: &Path,
) -> String {
    let stem = format!(
        "{}_{}_{}",
        document_type.archive_label(),
        period,
        fingerprint.short()
    );
    match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", stem, ext.to_lowercase()),
        None => stem,
    }
}

/// `<parent of original>/<dir_name>`
pub fn processed_dir(original: &Path, dir_name: &str) -> PathBuf {
    original
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(dir_name)
}

/// Move `original` to `<processed dir>/<name>`.
///
/// An existing target is never overwritten. If it already holds the same
/// bytes (a previous copy whose remove failed), the original is removed and
/// the existing target is returned.
pub fn archive_document(
    original: &Path,
    name: &str,
    dir_name: &str,
    fingerprint: &Fingerprint,
) -> Result<PathBuf, ArchiveFailure> {
    let dir = processed_dir(original, dir_name);
    fs::create_dir_all(&dir).map_err(|source| ArchiveFailure {
        path: dir.clone(),
        source,
    })?;

    let target = dir.join(name);
    let failure = |source: io::Error| ArchiveFailure {
        path: target.clone(),
        source,
    };

    if target.exists() {
        let existing = fingerprint_file(&target).map_err(failure)?;
        if &existing != fingerprint {
            return Err(failure(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a different file already has this archive name",
            )));
        }
        tracing::warn!(path = %target.display(), "archive target already present, removing original");
        fs::remove_file(original).map_err(failure)?;
        return Ok(target);
    }

    if let Err(rename_err) = fs::rename(original, &target) {
        // rename cannot cross filesystems
        tracing::debug!(error = %rename_err, "rename failed, copying instead");
        fs::copy(original, &target).map_err(failure)?;
        fs::remove_file(original).map_err(failure)?;
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    #[test]
    fn test_archive_name() {
        let fp = Fingerprint::from_hex("a1b2c3d4e5f60000");
        assert_eq!(
            archive_name(
                DocumentType::CheckingStatement,
                "2024-01",
                &fp,
                Path::new("/in/Cartola Enero.PDF")
            ),
            "checking_2024-01_a1b2c3d4.pdf"
        );
        assert_eq!(
            archive_name(DocumentType::CreditCardInternational, "2023-12", &fp, Path::new("export")),
            "credit_card_intl_2023-12_a1b2c3d4"
        );
    }

    #[test]
    fn test_archive_moves_into_sibling_dir() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("cartola.pdf");
        fs::write(&original, b"statement").unwrap();
        let fp = fingerprint_bytes(b"statement");

        let target = archive_document(&original, "checking_2024-01_x.pdf", "processed", &fp).unwrap();

        assert_eq!(target, dir.path().join("processed").join("checking_2024-01_x.pdf"));
        assert!(!original.exists());
        assert_eq!(fs::read(&target).unwrap(), b"statement");
    }

    #[test]
    fn test_archive_never_overwrites_a_different_file() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("new.pdf");
        fs::write(&original, b"new bytes").unwrap();
        fs::create_dir_all(dir.path().join("processed")).unwrap();
        let occupied = dir.path().join("processed").join("same_name.pdf");
        fs::write(&occupied, b"old bytes").unwrap();

        let err = archive_document(&original, "same_name.pdf", "processed", &fingerprint_bytes(b"new bytes"))
            .unwrap_err();

        assert_eq!(err.source.kind(), io::ErrorKind::AlreadyExists);
        assert!(original.exists());
        assert_eq!(fs::read(&occupied).unwrap(), b"old bytes");
    }

    #[test]
    fn test_archive_with_identical_target_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("again.pdf");
        fs::write(&original, b"same").unwrap();
        fs::create_dir_all(dir.path().join("processed")).unwrap();
        fs::write(dir.path().join("processed").join("t.pdf"), b"same").unwrap();

        let target = archive_document(&original, "t.pdf", "processed", &fingerprint_bytes(b"same")).unwrap();

        assert!(!original.exists());
        assert!(target.exists());
    }
}
