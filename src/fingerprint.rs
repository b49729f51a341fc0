// 🔑 Fingerprinter - content hash used as the document identity
//
// SHA-256 over the raw bytes, read in fixed 4 KiB blocks so memory stays flat
// regardless of file size. Same bytes, same fingerprint, whatever the filename.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest (e.g. read back from the database).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, used in archive names and status lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut block = [0u8; BLOCK_SIZE];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

pub fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    fingerprint_reader(File::open(path)?)
}

pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Primary-key lookup on `documents`. No side effects.
pub fn already_processed(conn: &Connection, fingerprint: &Fingerprint) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM documents WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use std::io::Cursor;

    #[test]
    fn test_fingerprint_is_stable_and_streamed() {
        // Larger than one block so the loop runs more than once
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let streamed = fingerprint_reader(Cursor::new(&data)).unwrap();
        let direct = fingerprint_bytes(&data);

        assert_eq!(streamed, direct);
        assert_eq!(streamed.as_str().len(), 64);
        assert_eq!(streamed.short().len(), 8);
    }

    #[test]
    fn test_fingerprint_known_vector() {
        let fp = fingerprint_bytes(b"abc");
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp.short(), "ba7816bf");
    }

    #[test]
    fn test_already_processed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let fp = fingerprint_bytes(b"statement");
        assert!(!already_processed(&conn, &fp).unwrap());

        conn.execute(
            "INSERT INTO documents (fingerprint, source_id, document_type, original_filename, status)
             VALUES (?1, 'banco-de-chile', 'checking_statement', 'cartola.pdf', 'committed')",
            params![fp.as_str()],
        )
        .unwrap();

        assert!(already_processed(&conn, &fp).unwrap());
    }
}
