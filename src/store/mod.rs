//! The revision tree engine
//!
//! This module owns the main relational store (`db.sync`) and everything in
//! it: documents, their revision trees, attachment bindings, and local
//! (non-replicated) documents. All mutations run as single transactions on
//! a one-connection pool, so writes are serialized and commit order matches
//! the order events are published on the store's bus.

mod migration;
pub mod revision;
mod schema;
mod winner;

use crate::attachments::{
    BlobStore, Encoding, PreparedAttachment, SavedAttachment, UnsavedAttachment,
    ATTACHMENTS_EXTENSION,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use revision::{DocumentRevision, RevisionId};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use winner::pick_winning_revision;

/// File name of the main relational store inside the store directory
pub const MAIN_DB_FILE: &str = "db.sync";

/// Directory holding per-extension state (attachments, query indexes)
pub const EXTENSIONS_DIR: &str = "extensions";

/// Full revision column list used by every raw revision query
const FULL_DOCUMENT_COLS: &str =
    "docs.docid, revs.doc_id, revs.sequence, revs.revid, revs.parent, \
     revs.current, revs.deleted, revs.json";

/// One page of the store's change log
#[derive(Debug)]
pub struct ChangesPage {
    pub results: Vec<DocumentRevision>,
    pub last_seq: i64,
}

/// A local (non-replicated) document
#[derive(Debug, Clone)]
pub struct LocalDocument {
    pub id: String,
    pub body: Vec<u8>,
}

/// Attachment intent for `update_document`: either new bytes, or carry an
/// attachment forward from the parent revision by name.
#[derive(Debug)]
pub enum AttachmentInput {
    New(UnsavedAttachment),
    Carry { name: String },
}

/// Attachment arriving with a force-inserted revision
#[derive(Debug)]
pub enum ForceInsertAttachment {
    /// Base64 payload embedded in the revision metadata
    Inline {
        name: String,
        data_base64: String,
        content_type: String,
        encoding: Encoding,
        length: Option<i64>,
        revpos: Option<i64>,
    },
    /// Payload already staged in the blob store (streamed pull)
    Prepared {
        attachment: PreparedAttachment,
        revpos: Option<i64>,
    },
}

/// A revision plus its ancestry, as received from a remote peer
#[derive(Debug)]
pub struct ForceInsertItem {
    pub id: String,
    /// Target revision id; must equal the last entry of `history`
    pub rev: String,
    pub body: Vec<u8>,
    pub deleted: bool,
    /// Ancestor rev ids in ascending generation order, ending at `rev`
    pub history: Vec<String>,
    pub attachments: Vec<ForceInsertAttachment>,
}

/// An embedded document store rooted at a directory on disk
pub struct DocumentStore {
    pool: SqlitePool,
    dir: PathBuf,
    blobs: BlobStore,
    events: EventBus<Event>,
}

impl DocumentStore {
    /// Open the store at `dir`, creating it if necessary.
    ///
    /// Opening an existing v1 store runs the duplicate-revision repair
    /// before the v2 uniqueness indexes are created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join(MAIN_DB_FILE);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Opening document store at {:?}", db_path);

        // One connection: acquisition order is commit order, which is what
        // makes per-store writes linearizable.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let blobs = BlobStore::open(&dir.join(EXTENSIONS_DIR).join(ATTACHMENTS_EXTENSION))?;

        let store = Self {
            pool,
            dir,
            blobs,
            events: EventBus::new(),
        };
        let created = store.migrate().await?;
        store.events.post(if created {
            Event::StoreCreated
        } else {
            Event::StoreOpened
        });
        Ok(store)
    }

    /// Bring the schema up to the current version. Returns true when the
    /// store was created from scratch.
    async fn migrate(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let initialized: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'info'",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let created = if initialized.is_none() {
            info!("Creating document store schema");
            sqlx::query(schema::SCHEMA_V1).execute(&mut *tx).await?;
            sqlx::query(schema::SCHEMA_V2).execute(&mut *tx).await?;
            schema::set_schema_version(&mut tx, schema::SCHEMA_VERSION).await?;
            true
        } else {
            match schema::schema_version(&mut tx).await? {
                1 => {
                    info!("Migrating store schema from version 1 to 2");
                    migration::repair_duplicate_revisions(&mut tx).await?;
                    sqlx::query(schema::SCHEMA_V2).execute(&mut *tx).await?;
                    schema::set_schema_version(&mut tx, schema::SCHEMA_VERSION).await?;
                    false
                }
                v if v == schema::SCHEMA_VERSION => false,
                v => {
                    return Err(Error::Corruption(format!(
                        "unsupported schema version {}",
                        v
                    )))
                }
            }
        };

        tx.commit().await?;
        Ok(created)
    }

    /// The directory this store lives in
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The store's event bus
    pub fn events(&self) -> &EventBus<Event> {
        &self.events
    }

    /// The content-addressed blob store for attachment payloads
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Close the store and release its connection
    pub async fn close(&self) {
        self.events.post(Event::StoreClosed);
        self.pool.close().await;
    }

    /// Close the store and delete everything under its directory
    pub async fn destroy(self) -> Result<()> {
        self.pool.close().await;
        std::fs::remove_dir_all(&self.dir)?;
        self.events.post(Event::StoreDeleted);
        Ok(())
    }

    // ===== Document CRUD =====

    /// Create a document, generating an id when none is supplied.
    ///
    /// Fails with a conflict when a live document with the same id exists;
    /// a deleted document is recreated under its tombstone.
    pub async fn create_document(
        &self,
        doc_id: Option<&str>,
        body: &[u8],
        attachments: Vec<UnsavedAttachment>,
    ) -> Result<DocumentRevision> {
        validate_body(body)?;
        let docid = match doc_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let mut prepared = Vec::with_capacity(attachments.len());
        for att in &attachments {
            prepared.push(self.blobs.prepare(
                &att.name,
                &att.data,
                &att.content_type,
                Encoding::Plain,
                None,
            )?);
        }
        let keys: Vec<(String, Vec<u8>)> = prepared
            .iter()
            .map(|p| (p.name.clone(), p.key.clone()))
            .collect();

        let mut tx = self.pool.begin().await?;

        let (doc_num, parent_seq, rev) = match get_numeric_id(&mut tx, &docid).await? {
            Some(doc_num) => match winning_revision(&mut tx, doc_num).await? {
                Some(winner) if !winner.deleted => {
                    return Err(Error::Conflict(format!(
                        "Document {} already exists",
                        docid
                    )));
                }
                Some(tombstone) => {
                    // recreate under the tombstone
                    let rev = RevisionId::child_of(&tombstone.rev, false, &keys, body);
                    (doc_num, Some(tombstone.sequence), rev)
                }
                None => (doc_num, None, RevisionId::root(false, &keys, body)),
            },
            None => {
                let doc_num = insert_doc_row(&mut tx, &docid).await?;
                (doc_num, None, RevisionId::root(false, &keys, body))
            }
        };

        if let Some(parent) = parent_seq {
            clear_current(&mut tx, parent).await?;
        }
        let sequence = insert_revision(
            &mut tx,
            doc_num,
            &rev.to_string(),
            parent_seq,
            true,
            false,
            Some(body),
        )
        .await?;

        let generation = rev.generation() as i64;
        for p in &prepared {
            insert_attachment_row(&mut tx, sequence, p, generation).await?;
        }
        pick_winning_revision(&mut tx, doc_num).await?;

        for p in prepared {
            self.blobs.persist(p)?;
        }
        tx.commit().await?;

        let doc = self.get_revision(&docid, &rev.to_string()).await?;
        debug!("Created document {} at {}", docid, rev);
        self.events.post(Event::DocumentCreated { doc: doc.clone() });
        Ok(doc)
    }

    /// Read the winning revision of a document. Tombstone winners are
    /// returned, not hidden; callers check `deleted`.
    pub async fn get_document(&self, doc_id: &str) -> Result<DocumentRevision> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM docs, revs \
             WHERE docs.docid = ? AND revs.sequence = docs.winning_seq",
            FULL_DOCUMENT_COLS
        ))
        .bind(doc_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;
        revision_from_row(&mut conn, &row).await
    }

    /// Read a specific revision of a document
    pub async fn get_revision(&self, doc_id: &str, rev: &str) -> Result<DocumentRevision> {
        let mut conn = self.pool.acquire().await?;
        fetch_revision(&mut conn, doc_id, rev).await
    }

    /// Update a document from its current winning leaf revision
    pub async fn update_document(
        &self,
        doc_id: &str,
        prev_rev: &str,
        body: &[u8],
        attachments: Vec<AttachmentInput>,
    ) -> Result<DocumentRevision> {
        validate_body(body)?;
        let prev_id: RevisionId = prev_rev.parse()?;

        let mut tx = self.pool.begin().await?;
        let prev = fetch_revision(&mut tx, doc_id, prev_rev).await?;
        if !prev.current {
            return Err(Error::Conflict(format!(
                "Revision {} of {} is not a leaf",
                prev_rev, doc_id
            )));
        }
        if prev.deleted {
            return Err(Error::Conflict(format!(
                "Revision {} of {} is deleted",
                prev_rev, doc_id
            )));
        }
        let doc_num = get_numeric_id(&mut tx, doc_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        // Split the attachment intent into payloads to stage and rows to
        // carry forward from the parent.
        let mut prepared = Vec::new();
        let mut carried = Vec::new();
        for input in attachments {
            match input {
                AttachmentInput::New(att) => {
                    prepared.push(self.blobs.prepare(
                        &att.name,
                        &att.data,
                        &att.content_type,
                        Encoding::Plain,
                        None,
                    )?);
                }
                AttachmentInput::Carry { name } => {
                    let att = prev
                        .attachments
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| Error::AttachmentNotFound(name.clone()))?;
                    carried.push(att);
                }
            }
        }
        let mut keys: Vec<(String, Vec<u8>)> = prepared
            .iter()
            .map(|p| (p.name.clone(), p.key.clone()))
            .collect();
        keys.extend(carried.iter().map(|a| (a.name.clone(), a.key.clone())));

        let rev = RevisionId::child_of(&prev_id, false, &keys, body);
        clear_current(&mut tx, prev.sequence).await?;
        let sequence = insert_revision(
            &mut tx,
            doc_num,
            &rev.to_string(),
            Some(prev.sequence),
            true,
            false,
            Some(body),
        )
        .await?;

        let generation = rev.generation() as i64;
        for p in &prepared {
            insert_attachment_row(&mut tx, sequence, p, generation).await?;
        }
        for att in &carried {
            copy_attachment_row(&mut tx, sequence, att).await?;
        }
        pick_winning_revision(&mut tx, doc_num).await?;

        for p in prepared {
            self.blobs.persist(p)?;
        }
        tx.commit().await?;

        let doc = self.get_revision(doc_id, &rev.to_string()).await?;
        debug!("Updated document {} to {}", doc_id, rev);
        self.events.post(Event::DocumentUpdated {
            prev: Some(prev),
            doc: doc.clone(),
        });
        Ok(doc)
    }

    /// Delete a document by writing a tombstone child of the given leaf
    pub async fn delete_document(
        &self,
        doc_id: &str,
        prev_rev: &str,
    ) -> Result<DocumentRevision> {
        let prev_id: RevisionId = prev_rev.parse()?;

        let mut tx = self.pool.begin().await?;
        let prev = fetch_revision(&mut tx, doc_id, prev_rev).await?;
        if prev.deleted {
            return Err(Error::DocumentNotFound(format!(
                "{} is already deleted",
                doc_id
            )));
        }
        if !prev.current {
            return Err(Error::Conflict(format!(
                "Revision {} of {} is not a leaf",
                prev_rev, doc_id
            )));
        }
        let doc_num = get_numeric_id(&mut tx, doc_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        let rev = RevisionId::child_of(&prev_id, true, &[], b"");
        clear_current(&mut tx, prev.sequence).await?;
        insert_revision(
            &mut tx,
            doc_num,
            &rev.to_string(),
            Some(prev.sequence),
            true,
            true,
            None,
        )
        .await?;
        pick_winning_revision(&mut tx, doc_num).await?;
        tx.commit().await?;

        let tombstone = self.get_revision(doc_id, &rev.to_string()).await?;
        debug!("Deleted document {} at {}", doc_id, rev);
        self.events.post(Event::DocumentDeleted {
            prev,
            tombstone: tombstone.clone(),
        });
        Ok(tombstone)
    }

    // ===== Force insert (replication write path) =====

    /// Insert revisions with their remote ancestry, grafting each onto the
    /// local tree. One transaction covers the whole item list; the returned
    /// events have already been posted on the store bus.
    pub async fn force_insert(&self, items: Vec<ForceInsertItem>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut to_persist = Vec::new();

        let mut tx = self.pool.begin().await?;
        for item in items {
            if let Some(event) =
                force_insert_item(&mut tx, item, &self.blobs, &mut to_persist).await?
            {
                events.push(event);
            }
        }
        for p in to_persist {
            self.blobs.persist(p)?;
        }
        tx.commit().await?;

        for event in &events {
            self.events.post(event.clone());
        }
        Ok(events)
    }

    /// Which of the given `(doc_id, rev_ids)` this store does not have yet.
    /// Documents with nothing missing are absent from the result.
    pub async fn revs_diff(
        &self,
        revisions: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut conn = self.pool.acquire().await?;
        let mut missing = HashMap::new();
        for (docid, revs) in revisions {
            let absent = match get_numeric_id(&mut conn, docid).await? {
                None => revs.clone(),
                Some(doc_num) => {
                    let mut absent = Vec::new();
                    for rev in revs {
                        if revision_sequence(&mut conn, doc_num, rev).await?.is_none() {
                            absent.push(rev.clone());
                        }
                    }
                    absent
                }
            };
            if !absent.is_empty() {
                missing.insert(docid.clone(), absent);
            }
        }
        Ok(missing)
    }

    // ===== Change log and enumeration =====

    /// Read a page of changes after `since`. Returns winning revisions of
    /// documents touched after that sequence, ordered by their latest
    /// change, and the last sequence the page covers.
    pub async fn changes(&self, since: i64, limit: usize) -> Result<ChangesPage> {
        let mut conn = self.pool.acquire().await?;
        let touched = sqlx::query(
            "SELECT doc_id, MAX(sequence) AS maxseq FROM revs WHERE sequence > ? \
             GROUP BY doc_id ORDER BY maxseq ASC LIMIT ?",
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut results = Vec::with_capacity(touched.len());
        let mut last_seq = since;
        for row in &touched {
            let doc_num: i64 = row.get(0);
            let maxseq: i64 = row.get(1);
            last_seq = last_seq.max(maxseq);
            if let Some(rev) = winning_revision(&mut conn, doc_num).await? {
                results.push(rev);
            }
        }
        Ok(ChangesPage { results, last_seq })
    }

    /// Winning, non-deleted revisions ordered by internal document id
    pub async fn get_all_documents(
        &self,
        offset: i64,
        limit: i64,
        descending: bool,
    ) -> Result<Vec<DocumentRevision>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {} FROM revs, docs \
             WHERE revs.deleted = 0 AND docs.doc_id = revs.doc_id \
             AND revs.sequence = docs.winning_seq \
             ORDER BY docs.doc_id {} LIMIT {} OFFSET {}",
            FULL_DOCUMENT_COLS,
            if descending { "DESC" } else { "ASC" },
            limit,
            offset
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            result.push(revision_from_row(&mut conn, row).await?);
        }
        Ok(result)
    }

    /// Ids of all live documents, in internal id order
    pub async fn get_all_document_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT docs.docid FROM docs, revs \
             WHERE revs.sequence = docs.winning_seq AND revs.deleted = 0 \
             ORDER BY docs.doc_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Ids of documents that currently have more than one live leaf
    pub async fn conflicted_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT docs.docid FROM docs, revs \
             WHERE docs.doc_id = revs.doc_id AND revs.current = 1 AND revs.deleted = 0 \
             GROUP BY docs.doc_id HAVING COUNT(*) > 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Resolve a conflicted document by tombstoning every live leaf other
    /// than `kept_rev`
    pub async fn resolve_conflicts(&self, doc_id: &str, kept_rev: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let doc_num = get_numeric_id(&mut tx, doc_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        let leaves = sqlx::query(
            "SELECT sequence, revid, deleted FROM revs WHERE doc_id = ? AND current = 1",
        )
        .bind(doc_num)
        .fetch_all(&mut *tx)
        .await?;

        if !leaves
            .iter()
            .any(|row| row.get::<String, _>(1) == kept_rev)
        {
            return Err(Error::RevisionNotFound(
                doc_id.to_string(),
                kept_rev.to_string(),
            ));
        }

        for row in &leaves {
            let sequence: i64 = row.get(0);
            let revid: String = row.get(1);
            let deleted: i64 = row.get(2);
            if revid == kept_rev || deleted != 0 {
                continue;
            }
            let losing: RevisionId = revid.parse()?;
            let tombstone = RevisionId::child_of(&losing, true, &[], b"");
            clear_current(&mut tx, sequence).await?;
            insert_revision(
                &mut tx,
                doc_num,
                &tombstone.to_string(),
                Some(sequence),
                true,
                true,
                None,
            )
            .await?;
        }
        pick_winning_revision(&mut tx, doc_num).await?;
        tx.commit().await?;
        info!("Resolved conflicts on {} keeping {}", doc_id, kept_rev);
        Ok(())
    }

    // ===== Maintenance =====

    /// Compact the store: empty the bodies of all non-leaf revisions (the
    /// tree structure stays, so future force-inserts still resolve
    /// history), drop their attachment rows, and sweep orphaned blobs.
    pub async fn compact(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let emptied = sqlx::query(
            "UPDATE revs SET json = NULL, available = 0 WHERE current = 0",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM attachments WHERE sequence IN \
             (SELECT sequence FROM revs WHERE current = 0)",
        )
        .execute(&mut *tx)
        .await?;
        let referenced: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT DISTINCT key FROM attachments")
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        let keys: HashSet<Vec<u8>> = referenced.into_iter().map(|(k,)| k).collect();
        let swept = self.blobs.sweep_orphans(&keys)?;
        info!(
            "Compacted store: {} revision bodies emptied, {} blobs removed",
            emptied.rows_affected(),
            swept
        );
        Ok(())
    }

    /// Number of live (non-deleted) documents
    pub async fn document_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM docs, revs \
             WHERE revs.sequence = docs.winning_seq AND revs.deleted = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Highest sequence ever written (0 for an empty store)
    pub async fn last_sequence(&self) -> Result<i64> {
        let (seq,): (i64,) = sqlx::query_as("SELECT IFNULL(MAX(sequence), 0) FROM revs")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    // ===== History =====

    /// Rev ids from the root to `rev`, ascending
    pub async fn revision_history(&self, doc_id: &str, rev: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        let doc_num = get_numeric_id(&mut conn, doc_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;
        let rows = sqlx::query("SELECT sequence, parent, revid FROM revs WHERE doc_id = ?")
            .bind(doc_num)
            .fetch_all(&mut *conn)
            .await?;

        let mut by_sequence: HashMap<i64, (Option<i64>, String)> = HashMap::new();
        let mut target = None;
        for row in &rows {
            let sequence: i64 = row.get(0);
            let parent: Option<i64> = row.get(1);
            let revid: String = row.get(2);
            if revid == rev {
                target = Some(sequence);
            }
            by_sequence.insert(sequence, (parent, revid));
        }
        let mut cursor =
            target.ok_or_else(|| Error::RevisionNotFound(doc_id.to_string(), rev.to_string()))?;

        let mut history = Vec::new();
        loop {
            let (parent, revid) = &by_sequence[&cursor];
            history.push(revid.clone());
            match parent {
                Some(parent) => cursor = *parent,
                None => break,
            }
        }
        history.reverse();
        Ok(history)
    }

    /// Rev ids of stored revisions with generation lower than `rev`'s,
    /// newest first. Used to populate `atts_since` during pulls; it is fine
    /// for the result to include revisions from sibling subtrees.
    pub async fn possible_ancestors(
        &self,
        doc_id: &str,
        rev: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let target: RevisionId = rev.parse()?;
        let mut conn = self.pool.acquire().await?;
        let Some(doc_num) = get_numeric_id(&mut conn, doc_id).await? else {
            return Ok(Vec::new());
        };
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT revid FROM revs WHERE doc_id = ? ORDER BY sequence DESC",
        )
        .bind(doc_num)
        .fetch_all(&mut *conn)
        .await?;

        let mut ancestors = Vec::new();
        for (revid,) in rows {
            let id: RevisionId = revid.parse()?;
            if id.generation() < target.generation() {
                ancestors.push(revid);
                if ancestors.len() >= limit {
                    break;
                }
            }
        }
        Ok(ancestors)
    }

    // ===== Attachments =====

    /// Attachment metadata bound to a revision (the winner when `rev` is
    /// None). The payload is read separately through [`Self::blobs`], so a
    /// missing blob never fails the metadata read.
    pub async fn get_attachment(
        &self,
        doc_id: &str,
        rev: Option<&str>,
        name: &str,
    ) -> Result<SavedAttachment> {
        let revision = match rev {
            Some(rev) => self.get_revision(doc_id, rev).await?,
            None => self.get_document(doc_id).await?,
        };
        revision
            .attachments
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AttachmentNotFound(name.to_string()))
    }

    // ===== Local documents =====

    /// Write a local document, overwriting any previous body
    pub async fn put_local(&self, doc_id: &str, body: &[u8]) -> Result<()> {
        validate_body(body)?;
        sqlx::query("INSERT OR REPLACE INTO localdocs (docid, json) VALUES (?, ?)")
            .bind(doc_id)
            .bind(body)
            .execute(&self.pool)
            .await?;
        debug!("Local doc written: {}", doc_id);
        Ok(())
    }

    /// Read a local document
    pub async fn get_local(&self, doc_id: &str) -> Result<LocalDocument> {
        let row = sqlx::query("SELECT json FROM localdocs WHERE docid = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;
        Ok(LocalDocument {
            id: doc_id.to_string(),
            body: row.get::<Option<Vec<u8>>, _>(0).unwrap_or_default(),
        })
    }

    /// Delete a local document
    pub async fn delete_local(&self, doc_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM localdocs WHERE docid = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(doc_id.to_string()));
        }
        Ok(())
    }
}

// ===== Transaction-level helpers =====

fn validate_body(body: &[u8]) -> Result<()> {
    if body.is_empty() {
        return Ok(());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidBody(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::InvalidBody("body must be a JSON object".to_string()));
    }
    Ok(())
}

async fn get_numeric_id(conn: &mut SqliteConnection, docid: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT doc_id FROM docs WHERE docid = ?")
        .bind(docid)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get(0)))
}

async fn insert_doc_row(conn: &mut SqliteConnection, docid: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO docs (docid) VALUES (?)")
        .bind(docid)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_revision(
    conn: &mut SqliteConnection,
    doc_id: i64,
    revid: &str,
    parent: Option<i64>,
    current: bool,
    deleted: bool,
    body: Option<&[u8]>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO revs (doc_id, parent, revid, current, deleted, available, json) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(doc_id)
    .bind(parent)
    .bind(revid)
    .bind(current as i64)
    .bind(deleted as i64)
    .bind(body.is_some() as i64)
    .bind(body)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn clear_current(conn: &mut SqliteConnection, sequence: i64) -> Result<()> {
    sqlx::query("UPDATE revs SET current = 0 WHERE sequence = ?")
        .bind(sequence)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_attachment_row(
    conn: &mut SqliteConnection,
    sequence: i64,
    prepared: &PreparedAttachment,
    revpos: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO attachments \
         (sequence, filename, key, type, encoding, length, encoded_length, revpos) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(sequence)
    .bind(&prepared.name)
    .bind(&prepared.key)
    .bind(&prepared.content_type)
    .bind(prepared.encoding.as_i64())
    .bind(prepared.length)
    .bind(prepared.encoded_length)
    .bind(revpos)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn copy_attachment_row(
    conn: &mut SqliteConnection,
    sequence: i64,
    att: &SavedAttachment,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO attachments \
         (sequence, filename, key, type, encoding, length, encoded_length, revpos) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(sequence)
    .bind(&att.name)
    .bind(&att.key)
    .bind(&att.content_type)
    .bind(att.encoding.as_i64())
    .bind(att.length)
    .bind(att.encoded_length)
    .bind(att.revpos)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn attachments_for_sequence(
    conn: &mut SqliteConnection,
    sequence: i64,
) -> Result<BTreeMap<String, SavedAttachment>> {
    let rows = sqlx::query(
        "SELECT filename, key, type, encoding, length, encoded_length, revpos \
         FROM attachments WHERE sequence = ?",
    )
    .bind(sequence)
    .fetch_all(&mut *conn)
    .await?;

    let mut attachments = BTreeMap::new();
    for row in &rows {
        let name: String = row.get(0);
        attachments.insert(
            name.clone(),
            SavedAttachment {
                name,
                key: row.get(1),
                content_type: row.get::<Option<String>, _>(2).unwrap_or_default(),
                encoding: Encoding::from_i64(row.get(3)),
                length: row.get(4),
                encoded_length: row.get(5),
                revpos: row.get(6),
            },
        );
    }
    Ok(attachments)
}

async fn revision_from_row(
    conn: &mut SqliteConnection,
    row: &SqliteRow,
) -> Result<DocumentRevision> {
    let sequence: i64 = row.get(2);
    let attachments = attachments_for_sequence(conn, sequence).await?;
    let revid: String = row.get(3);
    Ok(DocumentRevision {
        id: row.get(0),
        rev: revid.parse()?,
        body: row.get::<Option<Vec<u8>>, _>(7).unwrap_or_default(),
        deleted: row.get::<i64, _>(6) != 0,
        sequence,
        parent: row.get(4),
        current: row.get::<i64, _>(5) != 0,
        attachments,
    })
}

async fn fetch_revision(
    conn: &mut SqliteConnection,
    doc_id: &str,
    rev: &str,
) -> Result<DocumentRevision> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM docs, revs \
         WHERE docs.docid = ? AND revs.doc_id = docs.doc_id AND revs.revid = ?",
        FULL_DOCUMENT_COLS
    ))
    .bind(doc_id)
    .bind(rev)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::RevisionNotFound(doc_id.to_string(), rev.to_string()))?;
    revision_from_row(conn, &row).await
}

/// Winning revision of a document by numeric id, if any leaf exists
async fn winning_revision(
    conn: &mut SqliteConnection,
    doc_num: i64,
) -> Result<Option<DocumentRevision>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM docs, revs \
         WHERE docs.doc_id = ? AND revs.sequence = docs.winning_seq",
        FULL_DOCUMENT_COLS
    ))
    .bind(doc_num)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => Ok(Some(revision_from_row(conn, &row).await?)),
        None => Ok(None),
    }
}

async fn revision_sequence(
    conn: &mut SqliteConnection,
    doc_num: i64,
    revid: &str,
) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT sequence FROM revs WHERE doc_id = ? AND revid = ?")
        .bind(doc_num)
        .bind(revid)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Graft one force-inserted revision into the tree. Returns the event to
/// post, or None when the revision was already present (idempotent replay).
async fn force_insert_item(
    conn: &mut SqliteConnection,
    item: ForceInsertItem,
    blobs: &BlobStore,
    to_persist: &mut Vec<PreparedAttachment>,
) -> Result<Option<Event>> {
    debug!("force_insert: {} at {}", item.id, item.rev);
    let target: RevisionId = item.rev.parse()?;
    if item.history.last() != Some(&item.rev) {
        return Err(Error::Replication(format!(
            "revision history for {} does not end at {}",
            item.id, item.rev
        )));
    }
    if !item.deleted {
        validate_body(&item.body)?;
    }

    let existing = get_numeric_id(conn, &item.id).await?;

    let (doc_num, prev_winner) = match existing {
        None => (insert_doc_row(conn, &item.id).await?, None),
        Some(doc_num) => {
            if revision_sequence(conn, doc_num, &item.rev).await?.is_some() {
                debug!("Revision {} of {} already stored, skipping", item.rev, item.id);
                return Ok(None);
            }
            (doc_num, winning_revision(conn, doc_num).await?)
        }
    };

    // Deepest common ancestor: the history is ascending, so the last rev id
    // already in the tree is where the incoming chain grafts on. No match
    // means a sibling root.
    let mut parent: Option<i64> = None;
    let mut start = 0;
    for (i, revid) in item.history.iter().enumerate() {
        if let Some(sequence) = revision_sequence(conn, doc_num, revid).await? {
            parent = Some(sequence);
            start = i + 1;
        }
    }
    if let Some(ancestor) = parent {
        clear_current(conn, ancestor).await?;
    }

    // The target itself cannot be the common ancestor (that case returned
    // above as an idempotent replay), so there is always at least one row
    // left to insert: the missing inner ancestors, then the leaf.
    let last = item.history.len() - 1;
    for revid in &item.history[start.min(last)..last] {
        let sequence =
            insert_revision(conn, doc_num, revid, parent, false, false, None).await?;
        parent = Some(sequence);
    }
    let target_sequence = insert_revision(
        conn,
        doc_num,
        &item.rev,
        parent,
        true,
        item.deleted,
        Some(&item.body),
    )
    .await?;

    for attachment in item.attachments {
        match attachment {
            ForceInsertAttachment::Inline {
                name,
                data_base64,
                content_type,
                encoding,
                length,
                revpos,
            } => {
                let data = BASE64.decode(data_base64.as_bytes()).map_err(|e| {
                    Error::AttachmentNotSaved(format!("{}: bad base64: {}", name, e))
                })?;
                let prepared =
                    blobs.prepare(&name, &data, &content_type, encoding, length)?;
                let revpos = revpos.unwrap_or(target.generation() as i64);
                insert_attachment_row(conn, target_sequence, &prepared, revpos).await?;
                to_persist.push(prepared);
            }
            ForceInsertAttachment::Prepared { attachment, revpos } => {
                let revpos = revpos.unwrap_or(target.generation() as i64);
                insert_attachment_row(conn, target_sequence, &attachment, revpos).await?;
                to_persist.push(attachment);
            }
        }
    }

    pick_winning_revision(conn, doc_num).await?;

    let doc = fetch_revision(conn, &item.id, &item.rev).await?;
    if prev_winner.is_some() {
        Ok(Some(Event::DocumentUpdated {
            prev: prev_winner,
            doc,
        }))
    } else {
        Ok(Some(Event::DocumentCreated { doc }))
    }
}
