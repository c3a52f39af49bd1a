//! Winning-revision selection
//!
//! The winner is a pure function of a document's leaf set: restrict to
//! non-deleted leaves (falling back to deleted leaves when none remain),
//! then take the highest generation, tie-broken lexicographically on the
//! digest. The chosen sequence is materialized on the `docs` row so reads
//! never scan leaves.

use crate::error::Result;
use crate::store::revision::RevisionId;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

/// Recompute and materialize the winner for one document.
///
/// Must run inside the same transaction as any mutation that changed the
/// document's leaf set.
pub(crate) async fn pick_winning_revision(
    conn: &mut SqliteConnection,
    doc_id: i64,
) -> Result<()> {
    let leaves = sqlx::query(
        "SELECT sequence, revid, deleted FROM revs WHERE doc_id = ? AND current = 1",
    )
    .bind(doc_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut candidates: Vec<(RevisionId, bool, i64)> = Vec::with_capacity(leaves.len());
    for row in &leaves {
        let sequence: i64 = row.get(0);
        let revid: String = row.get(1);
        let deleted: i64 = row.get(2);
        candidates.push((revid.parse()?, deleted != 0, sequence));
    }

    let winner = select_winner(&candidates);

    sqlx::query("UPDATE docs SET winning_seq = ? WHERE doc_id = ?")
        .bind(winner)
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Pick the winning sequence from `(rev, deleted, sequence)` leaves
fn select_winner(leaves: &[(RevisionId, bool, i64)]) -> Option<i64> {
    let live = leaves.iter().filter(|(_, deleted, _)| !deleted);
    let pool: Vec<_> = if leaves.iter().any(|(_, deleted, _)| !deleted) {
        live.collect()
    } else {
        leaves.iter().collect()
    };
    pool.into_iter()
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, _, sequence)| *sequence)
}
