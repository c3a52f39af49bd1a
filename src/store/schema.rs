//! SQLite schema for the main document store

use crate::error::{Error, Result};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 2;

/// Version 1 layout: documents, revision tree, attachments, local documents
/// and the info key/value table.
///
/// `revs.sequence` is AUTOINCREMENT so sequence values are never reused,
/// which keeps the per-store change log strictly increasing even across
/// compaction and repair.
pub const SCHEMA_V1: &str = r#"
-- Documents: one row per document id, with the materialized winner pointer
CREATE TABLE IF NOT EXISTS docs (
    doc_id INTEGER PRIMARY KEY,
    docid TEXT UNIQUE NOT NULL,
    winning_seq INTEGER REFERENCES revs(sequence)
);

-- Revisions: the per-document tree, stored as (sequence, parent) rows
CREATE TABLE IF NOT EXISTS revs (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id INTEGER NOT NULL REFERENCES docs(doc_id),
    parent INTEGER REFERENCES revs(sequence),
    revid TEXT NOT NULL,
    current INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    available INTEGER NOT NULL DEFAULT 1,
    json BLOB
);

-- Attachments: blob references bound to the revision that carries them
CREATE TABLE IF NOT EXISTS attachments (
    sequence INTEGER NOT NULL REFERENCES revs(sequence),
    filename TEXT NOT NULL,
    key BLOB NOT NULL,
    type TEXT,
    encoding INTEGER NOT NULL DEFAULT 0,
    length INTEGER NOT NULL DEFAULT 0,
    encoded_length INTEGER,
    revpos INTEGER NOT NULL DEFAULT 0
);

-- Local (non-replicated) documents: plain overwrite semantics
CREATE TABLE IF NOT EXISTS localdocs (
    docid TEXT PRIMARY KEY,
    json BLOB
);

-- Store metadata
CREATE TABLE IF NOT EXISTS info (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE INDEX IF NOT EXISTS idx_revs_doc ON revs(doc_id, current, deleted);
CREATE INDEX IF NOT EXISTS idx_revs_parent ON revs(parent);
CREATE INDEX IF NOT EXISTS idx_attachments_sequence ON attachments(sequence);
"#;

/// Version 2 delta: uniqueness over `(doc_id, revid)` and
/// `(sequence, filename)`. Created only after the duplicate-revision repair
/// has run, since a corrupted v1 store may violate both.
pub const SCHEMA_V2: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_revs_docid_revid ON revs(doc_id, revid);
CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_unique ON attachments(sequence, filename);
"#;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Read the schema version recorded in the info table (0 when absent)
pub async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
    let row = sqlx::query("SELECT value FROM info WHERE key = ?")
        .bind(SCHEMA_VERSION_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let value: String = row.get(0);
            value
                .parse()
                .map_err(|_| Error::Corruption(format!("bad schema version: {}", value)))
        }
        None => Ok(0),
    }
}

/// Record the schema version in the info table
pub async fn set_schema_version(conn: &mut SqliteConnection, version: i64) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO info (key, value) VALUES (?, ?)")
        .bind(SCHEMA_VERSION_KEY)
        .bind(version.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}
