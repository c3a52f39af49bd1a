//! Content-addressed attachment storage
//!
//! Attachment payloads live as files named by the SHA-1 of their stored
//! bytes, under `extensions/com.cloudant.attachments/`. New payloads are
//! staged into a temp file first (hashing and measuring as they are
//! written), and only renamed into place once the enclosing SQL transaction
//! is ready to commit. Renames are write-once: a colliding key means the
//! bytes are already on disk.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Directory name for the blob store, relative to the store's extensions dir
pub const ATTACHMENTS_EXTENSION: &str = "com.cloudant.attachments";

/// On-the-wire / at-rest encoding of an attachment payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Gzip,
}

impl Encoding {
    /// Integer form stored in the `attachments.encoding` column
    pub fn as_i64(self) -> i64 {
        match self {
            Encoding::Plain => 0,
            Encoding::Gzip => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            Encoding::Gzip
        } else {
            Encoding::Plain
        }
    }

    /// Parse the CouchDB `encoding` attachment field; absent means plain
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(s) if s.eq_ignore_ascii_case("gzip") => Encoding::Gzip,
            _ => Encoding::Plain,
        }
    }
}

/// An attachment not yet saved to the store
#[derive(Debug, Clone)]
pub struct UnsavedAttachment {
    pub name: String,
    pub data: Vec<u8>,
    pub content_type: String,
}

/// An attachment row bound to a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedAttachment {
    pub name: String,
    /// SHA-1 of the stored bytes; the blob file name is its hex form
    pub key: Vec<u8>,
    pub content_type: String,
    pub encoding: Encoding,
    /// Decoded payload length in bytes
    pub length: i64,
    /// Stored length when the payload is encoded
    pub encoded_length: Option<i64>,
    /// Generation at which this attachment was introduced
    pub revpos: i64,
}

/// A payload staged on disk, hashed and measured, awaiting persist
#[derive(Debug)]
pub struct PreparedAttachment {
    pub name: String,
    pub key: Vec<u8>,
    pub content_type: String,
    pub encoding: Encoding,
    pub length: i64,
    pub encoded_length: Option<i64>,
    staged: NamedTempFile,
}

/// The content-addressed blob store backing attachment payloads
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if necessary) the blob directory
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Stage a payload: write to a temp file, computing key and lengths.
    ///
    /// `data` is the stored form. For `Plain` that is the raw payload; for
    /// `Gzip` it is the gzipped bytes as transferred, with `raw_length` the
    /// declared decoded size.
    pub fn prepare(
        &self,
        name: &str,
        data: &[u8],
        content_type: &str,
        encoding: Encoding,
        raw_length: Option<i64>,
    ) -> Result<PreparedAttachment> {
        let mut staged = NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::AttachmentNotSaved(format!("{}: {}", name, e)))?;
        staged
            .write_all(data)
            .map_err(|e| Error::AttachmentNotSaved(format!("{}: {}", name, e)))?;

        let mut hasher = Sha1::new();
        hasher.update(data);
        let key = hasher.finalize().to_vec();

        let (length, encoded_length) = match encoding {
            Encoding::Plain => (data.len() as i64, None),
            Encoding::Gzip => (
                raw_length.unwrap_or(data.len() as i64),
                Some(data.len() as i64),
            ),
        };

        Ok(PreparedAttachment {
            name: name.to_string(),
            key,
            content_type: content_type.to_string(),
            encoding,
            length,
            encoded_length,
            staged,
        })
    }

    /// Move a staged payload into its content-addressed location.
    ///
    /// Write-once: if the key already exists the staged copy is discarded,
    /// since equal keys mean byte-equal content.
    pub fn persist(&self, prepared: PreparedAttachment) -> Result<()> {
        let target = self.path_for(&prepared.key);
        if target.exists() {
            debug!("Blob {} already present, dropping staged copy", hex::encode(&prepared.key));
            return Ok(());
        }
        prepared
            .staged
            .persist(&target)
            .map_err(|e| Error::AttachmentNotSaved(format!("{}: {}", prepared.name, e.error)))?;
        Ok(())
    }

    /// Stored bytes for a key
    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        std::fs::read(&path).map_err(|_| Error::AttachmentNotFound(hex::encode(key)))
    }

    /// Decoded payload for a saved attachment, gunzipping when necessary
    pub fn read_decoded(&self, attachment: &SavedAttachment) -> Result<Vec<u8>> {
        let stored = self.read(&attachment.key)?;
        match attachment.encoding {
            Encoding::Plain => Ok(stored),
            Encoding::Gzip => {
                let mut decoder = GzDecoder::new(&stored[..]);
                let mut out = Vec::with_capacity(attachment.length.max(0) as usize);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Corruption(format!(
                        "gzip attachment {} unreadable: {}",
                        attachment.name, e
                    )))?;
                Ok(out)
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.path_for(key).exists()
    }

    /// Path of the blob file for a key
    pub fn path_for(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(key))
    }

    /// Remove blob files whose key appears in no attachment row.
    ///
    /// Returns the number of files removed. Non-hex names (staging temp
    /// files) are left alone.
    pub fn sweep_orphans(&self, referenced: &HashSet<Vec<u8>>) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(key) = hex::decode(name) else { continue };
            if !referenced.contains(&key) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("Failed to remove orphaned blob {}: {}", name, e);
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_prepare_persist_read_round_trip() {
        let (_dir, store) = store();
        let prepared = store
            .prepare("a.txt", b"hello blob", "text/plain", Encoding::Plain, None)
            .unwrap();
        let key = prepared.key.clone();
        assert_eq!(prepared.length, 10);
        assert_eq!(prepared.encoded_length, None);

        store.persist(prepared).unwrap();
        assert!(store.contains(&key));
        assert_eq!(store.read(&key).unwrap(), b"hello blob");
    }

    #[test]
    fn test_persist_is_write_once() {
        let (_dir, store) = store();
        let first = store
            .prepare("a", b"same bytes", "text/plain", Encoding::Plain, None)
            .unwrap();
        let key = first.key.clone();
        store.persist(first).unwrap();

        let second = store
            .prepare("b", b"same bytes", "text/plain", Encoding::Plain, None)
            .unwrap();
        assert_eq!(second.key, key);
        store.persist(second).unwrap();
        assert_eq!(store.read(&key).unwrap(), b"same bytes");
    }

    #[test]
    fn test_gzip_decode() {
        let (_dir, store) = store();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"squeeze me").unwrap();
        let gz = encoder.finish().unwrap();

        let prepared = store
            .prepare("z.txt", &gz, "text/plain", Encoding::Gzip, Some(10))
            .unwrap();
        assert_eq!(prepared.length, 10);
        assert_eq!(prepared.encoded_length, Some(gz.len() as i64));
        let key = prepared.key.clone();
        store.persist(prepared).unwrap();

        let saved = SavedAttachment {
            name: "z.txt".to_string(),
            key,
            content_type: "text/plain".to_string(),
            encoding: Encoding::Gzip,
            length: 10,
            encoded_length: Some(gz.len() as i64),
            revpos: 1,
        };
        assert_eq!(store.read_decoded(&saved).unwrap(), b"squeeze me");
    }

    #[test]
    fn test_missing_blob_reports_attachment_not_found() {
        let (_dir, store) = store();
        let err = store.read(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::AttachmentNotFound(_)));
    }

    #[test]
    fn test_sweep_orphans() {
        let (_dir, store) = store();
        let keep = store
            .prepare("keep", b"keep", "text/plain", Encoding::Plain, None)
            .unwrap();
        let keep_key = keep.key.clone();
        store.persist(keep).unwrap();

        let drop = store
            .prepare("drop", b"drop", "text/plain", Encoding::Plain, None)
            .unwrap();
        let drop_key = drop.key.clone();
        store.persist(drop).unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(keep_key.clone());
        let removed = store.sweep_orphans(&referenced).unwrap();
        assert_eq!(removed, 1);
        assert!(store.contains(&keep_key));
        assert!(!store.contains(&drop_key));
    }
}
