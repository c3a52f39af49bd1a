//! Open-time repair of stores containing duplicated revisions
//!
//! A v1 store may hold several `revs` rows with the same `(doc_id, revid)`,
//! and duplicated `(sequence, filename)` attachment rows, both produced by
//! identical replications racing each other. The repair keeps the row with
//! the lowest sequence, re-parents children and migrates attachment rows to
//! it, deletes the rest, collapses duplicate attachment rows, and re-runs
//! winner selection for every touched document. Only after this can the v2
//! uniqueness indexes be created.

use crate::error::Result;
use crate::store::winner::pick_winning_revision;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::info;

const ALL_BUT_LOWEST: &str =
    "(SELECT sequence FROM revs WHERE doc_id = ? AND revid = ? AND sequence != ?)";

struct DuplicateRevision {
    doc_id: i64,
    revid: String,
    lowest_sequence: i64,
}

/// Run the duplicate-revision repair inside an open transaction
pub(crate) async fn repair_duplicate_revisions(conn: &mut SqliteConnection) -> Result<()> {
    let duplicates = find_duplicate_revisions(&mut *conn).await?;
    info!("Found {} duplicated revisions", duplicates.len());

    for duplicate in &duplicates {
        collapse_duplicate_revision(&mut *conn, duplicate).await?;
        collapse_duplicate_attachments(&mut *conn, duplicate).await?;
        pick_winning_revision(&mut *conn, duplicate.doc_id).await?;
    }
    Ok(())
}

async fn find_duplicate_revisions(
    conn: &mut SqliteConnection,
) -> Result<Vec<DuplicateRevision>> {
    let rows = sqlx::query(
        "SELECT doc_id, revid, MIN(sequence) FROM revs \
         GROUP BY doc_id, revid HAVING COUNT(*) > 1",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DuplicateRevision {
            doc_id: row.get(0),
            revid: row.get(1),
            lowest_sequence: row.get(2),
        })
        .collect())
}

async fn collapse_duplicate_revision(
    conn: &mut SqliteConnection,
    duplicate: &DuplicateRevision,
) -> Result<()> {
    let children = sqlx::query(&format!(
        "UPDATE revs SET parent = ? WHERE parent IN {}",
        ALL_BUT_LOWEST
    ))
    .bind(duplicate.lowest_sequence)
    .bind(duplicate.doc_id)
    .bind(&duplicate.revid)
    .bind(duplicate.lowest_sequence)
    .execute(&mut *conn)
    .await?;
    if children.rows_affected() > 0 {
        info!(
            "Re-parented {} children onto {}:{}",
            children.rows_affected(),
            duplicate.doc_id,
            duplicate.lowest_sequence
        );
    }

    let attachments = sqlx::query(&format!(
        "UPDATE attachments SET sequence = ? WHERE sequence IN {}",
        ALL_BUT_LOWEST
    ))
    .bind(duplicate.lowest_sequence)
    .bind(duplicate.doc_id)
    .bind(&duplicate.revid)
    .bind(duplicate.lowest_sequence)
    .execute(&mut *conn)
    .await?;
    if attachments.rows_affected() > 0 {
        info!(
            "Migrated {} attachments to {}:{}",
            attachments.rows_affected(),
            duplicate.doc_id,
            duplicate.lowest_sequence
        );
    }

    let deleted = sqlx::query(&format!(
        "DELETE FROM revs WHERE sequence IN {}",
        ALL_BUT_LOWEST
    ))
    .bind(duplicate.doc_id)
    .bind(&duplicate.revid)
    .bind(duplicate.lowest_sequence)
    .execute(&mut *conn)
    .await?;
    if deleted.rows_affected() > 0 {
        info!(
            "Deleted {} duplicate revisions of {}:{}",
            deleted.rows_affected(),
            duplicate.doc_id,
            duplicate.lowest_sequence
        );
    }

    // re-parenting may have turned the kept row into an inner node
    sqlx::query(
        "UPDATE revs SET current = 0 WHERE sequence = ? \
         AND EXISTS (SELECT 1 FROM revs AS child WHERE child.parent = ?)",
    )
    .bind(duplicate.lowest_sequence)
    .bind(duplicate.lowest_sequence)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Within the surviving sequence, collapse duplicated `(sequence, filename)`
/// attachment rows down to one.
async fn collapse_duplicate_attachments(
    conn: &mut SqliteConnection,
    duplicate: &DuplicateRevision,
) -> Result<()> {
    let rows = sqlx::query(
        "SELECT filename, COUNT(*) FROM attachments WHERE sequence = ? \
         GROUP BY filename HAVING COUNT(*) > 1",
    )
    .bind(duplicate.lowest_sequence)
    .fetch_all(&mut *conn)
    .await?;

    for row in &rows {
        let filename: String = row.get(0);
        let count: i64 = row.get(1);
        let removed = sqlx::query(
            "DELETE FROM attachments WHERE rowid IN (SELECT rowid FROM attachments \
             WHERE sequence = ? AND filename = ? ORDER BY rowid DESC LIMIT ?)",
        )
        .bind(duplicate.lowest_sequence)
        .bind(&filename)
        .bind(count - 1)
        .execute(&mut *conn)
        .await?;
        info!(
            "Deleted {} duplicate copies of attachment {} on {}:{}",
            removed.rows_affected(),
            filename,
            duplicate.doc_id,
            duplicate.lowest_sequence
        );
    }
    Ok(())
}
