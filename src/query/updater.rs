//! Keeping shadow tables current with the main store
//!
//! Indexes are brought up to date lazily, on each query: every index whose
//! `last_sequence` lags the store replays the change log from that point.
//! For each changed document the prior shadow rows are deleted and fresh
//! rows inserted, one per element for an array-valued field, which is what
//! makes `$eq` over array members work. The new `last_sequence` commits in
//! the same transaction as the rows it covers.

use crate::error::Result;
use crate::query::index::{list_indexes, table_name_for_index, Index};
use crate::query::matcher;
use crate::query::translator::SqlArgument;
use crate::query::{bind_argument, METADATA_TABLE};
use crate::store::revision::DocumentRevision;
use crate::store::DocumentStore;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

const UPDATE_BATCH_SIZE: usize = 500;

/// Refresh every index to the store's current sequence
pub(crate) async fn update_all_indexes(store: &DocumentStore, pool: &SqlitePool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let indexes = list_indexes(&mut conn).await?;
    drop(conn);
    for index in &indexes {
        update_index(store, pool, index).await?;
    }
    Ok(())
}

/// Replay the store's change log into one index's shadow table
pub(crate) async fn update_index(
    store: &DocumentStore,
    pool: &SqlitePool,
    index: &Index,
) -> Result<()> {
    loop {
        let last = last_sequence(pool, &index.name).await?;
        let page = store.changes(last, UPDATE_BATCH_SIZE).await?;
        if page.results.is_empty() && page.last_seq == last {
            break;
        }
        debug!(
            "Updating index \"{}\" with {} changes (sequence {} -> {})",
            index.name,
            page.results.len(),
            last,
            page.last_seq
        );

        let mut tx = pool.begin().await?;
        for revision in &page.results {
            index_revision(&mut tx, index, revision).await?;
        }
        sqlx::query(&format!(
            "UPDATE {} SET last_sequence = ? WHERE index_name = ?",
            METADATA_TABLE
        ))
        .bind(page.last_seq)
        .bind(&index.name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if page.results.len() < UPDATE_BATCH_SIZE {
            break;
        }
    }
    Ok(())
}

async fn last_sequence(pool: &SqlitePool, index_name: &str) -> Result<i64> {
    let (seq,): (i64,) = sqlx::query_as(&format!(
        "SELECT IFNULL(MIN(last_sequence), 0) FROM {} WHERE index_name = ?",
        METADATA_TABLE
    ))
    .bind(index_name)
    .fetch_one(pool)
    .await?;
    Ok(seq)
}

async fn index_revision(
    conn: &mut SqliteConnection,
    index: &Index,
    revision: &DocumentRevision,
) -> Result<()> {
    let table = table_name_for_index(&index.name);
    sqlx::query(&format!("DELETE FROM \"{}\" WHERE \"_id\" = ?", table))
        .bind(&revision.id)
        .execute(&mut *conn)
        .await?;

    if revision.deleted {
        return Ok(());
    }
    let Some(rows) = unroll(index, revision)? else {
        return Ok(());
    };

    let columns = index
        .fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; index.fields.len()].join(", ");
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table, columns, placeholders
    );

    for row in rows {
        let mut query = sqlx::query(&sql);
        for argument in row {
            query = bind_argument(query, argument);
        }
        query.execute(&mut *conn).await?;
    }
    Ok(())
}

/// The shadow rows for one revision: a single row, or one per element when
/// exactly one indexed field is array-valued. A revision with two
/// array-valued indexed fields cannot be represented and is not indexed.
fn unroll(index: &Index, revision: &DocumentRevision) -> Result<Option<Vec<Vec<SqlArgument>>>> {
    let body = revision.body_json()?;

    let mut scalars: Vec<SqlArgument> = Vec::with_capacity(index.fields.len());
    let mut array_field: Option<(usize, Vec<Value>)> = None;

    for (position, field) in index.fields.iter().enumerate() {
        let value = match field.as_str() {
            "_id" => Some(Value::String(revision.id.clone())),
            "_rev" => Some(Value::String(revision.rev.to_string())),
            path => matcher::extract(&body, path).cloned(),
        };
        match value {
            Some(Value::Array(items)) => {
                if array_field.is_some() {
                    warn!(
                        "Document {} has more than one array field in index \"{}\", \
                         not indexing it",
                        revision.id, index.name
                    );
                    return Ok(None);
                }
                array_field = Some((position, items));
                scalars.push(SqlArgument::Null);
            }
            Some(value) => scalars.push(SqlArgument::from(&value)),
            None => scalars.push(SqlArgument::Null),
        }
    }

    let rows = match array_field {
        Some((position, items)) if !items.is_empty() => items
            .iter()
            .map(|item| {
                let mut row = scalars.clone();
                row[position] = SqlArgument::from(item);
                row
            })
            .collect(),
        _ => vec![scalars],
    };
    Ok(Some(rows))
}
