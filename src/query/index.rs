//! Index definitions, creation and deletion
//!
//! Indexes live in their own relational database. Each index is a shadow
//! table `_t_<name>` with one column per indexed field plus the implicit
//! leading `_rev` and `_id` columns, covered by a single composite SQL
//! index. Metadata rows (one per field) carry the index definition and the
//! `last_sequence` up to which the shadow table has been brought current.

use crate::error::{Error, Result};
use crate::query::METADATA_TABLE;
use sha1::{Digest, Sha1};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

const GENERATED_INDEX_NAME_PREFIX: &str = "satchel.query.GeneratedIndexName.";

/// Kind of index: plain json columns or an FTS table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Json,
    Text,
}

impl IndexType {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexType::Json => "json",
            IndexType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(IndexType::Json),
            "text" => Ok(IndexType::Text),
            other => Err(Error::Index(format!("Unknown index type: {}", other))),
        }
    }
}

/// A (possibly compound) index over document fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub index_type: IndexType,
    /// Field list including the implicit leading `_rev`, `_id`
    pub fields: Vec<String>,
    /// Tokenizer setting, text indexes only
    pub settings: Option<String>,
}

impl Index {
    fn same_definition(&self, other: &Index) -> bool {
        self.index_type == other.index_type
            && self.fields == other.fields
            && self.settings == other.settings
    }
}

/// Shadow table name for an index
pub fn table_name_for_index(name: &str) -> String {
    format!("_t_{}", name)
}

/// Field names may not contain `$`-prefixed path segments; those make the
/// selector language ambiguous.
pub fn valid_field_name(field: &str) -> bool {
    field.split('.').all(|part| !part.starts_with('$') && !part.is_empty())
}

/// Normalize a proposed field list: validate, reject duplicates, and
/// prepend the implicit `_rev` and `_id` columns.
fn prepare_field_names(fields: &[String]) -> Result<Vec<String>> {
    if fields.is_empty() {
        return Err(Error::Index("Index field list is empty".to_string()));
    }
    let mut unique = BTreeMap::new();
    for field in fields {
        if !valid_field_name(field) {
            return Err(Error::Index(format!("Field {} is not valid", field)));
        }
        if unique.insert(field.as_str(), ()).is_some() {
            return Err(Error::Index(format!(
                "Cannot create index with duplicated field name {}",
                field
            )));
        }
    }

    let mut prepared = fields.to_vec();
    if !unique.contains_key("_rev") {
        prepared.insert(0, "_rev".to_string());
    }
    if !unique.contains_key("_id") {
        prepared.insert(0, "_id".to_string());
    }
    Ok(prepared)
}

/// Deterministic generated name for an unnamed index
fn generated_name(index_type: IndexType, fields: &[String]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(index_type.as_str().as_bytes());
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    format!(
        "{}{}",
        GENERATED_INDEX_NAME_PREFIX,
        &hex::encode(hasher.finalize())[..16]
    )
}

/// Is the underlying SQLite built with FTS5?
pub(crate) async fn text_search_available(pool: &SqlitePool) -> Result<bool> {
    let (enabled,): (i64,) =
        sqlx::query_as("SELECT sqlite_compileoption_used('SQLITE_ENABLE_FTS5')")
            .fetch_one(pool)
            .await?;
    Ok(enabled != 0)
}

/// All indexes recorded in the metadata table
pub(crate) async fn list_indexes(conn: &mut SqliteConnection) -> Result<Vec<Index>> {
    let rows = sqlx::query(&format!(
        "SELECT index_name, index_type, index_settings, field_name FROM {} \
         ORDER BY index_name, rowid",
        METADATA_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;

    let mut indexes: Vec<Index> = Vec::new();
    for row in &rows {
        let name: String = row.get(0);
        let field: String = row.get(3);
        match indexes.last_mut() {
            Some(index) if index.name == name => index.fields.push(field),
            _ => indexes.push(Index {
                name,
                index_type: IndexType::parse(&row.get::<String, _>(1))?,
                settings: row.get(2),
                fields: vec![field],
            }),
        }
    }
    Ok(indexes)
}

/// Create an index, or update it when an identical definition already
/// exists under the same name. Returns the effective index.
pub(crate) async fn ensure_indexed(
    pool: &SqlitePool,
    fields: &[String],
    name: Option<&str>,
    index_type: IndexType,
    settings: Option<&str>,
) -> Result<Index> {
    let prepared = prepare_field_names(fields)?;
    if index_type == IndexType::Text && !text_search_available(pool).await? {
        return Err(Error::Index(
            "Text search not supported: SQLite was built without FTS5".to_string(),
        ));
    }

    let proposed = Index {
        name: name
            .map(str::to_string)
            .unwrap_or_else(|| generated_name(index_type, &prepared)),
        index_type,
        fields: prepared,
        settings: settings.map(str::to_string),
    };

    let mut conn = pool.acquire().await?;
    let existing = list_indexes(&mut conn).await?;
    for index in &existing {
        if proposed.index_type == IndexType::Text && index.index_type == IndexType::Text {
            return Err(Error::Index(format!(
                "Text index limit reached: there is an existing text index \"{}\"",
                index.name
            )));
        }
        if index.name == proposed.name {
            if index.same_definition(&proposed) {
                debug!("Index \"{}\" already exists with same definition", index.name);
                return Ok(index.clone());
            }
            return Err(Error::Index(format!(
                "Index \"{}\" already exists with a different definition",
                index.name
            )));
        }
        if index.same_definition(&proposed) {
            debug!(
                "Index \"{}\" has the same definition as requested \"{}\"",
                index.name, proposed.name
            );
            return Ok(index.clone());
        }
    }
    drop(conn);

    create_index(pool, &proposed).await?;
    info!(
        "Created {} index \"{}\" over {:?}",
        proposed.index_type.as_str(),
        proposed.name,
        proposed.fields
    );
    Ok(proposed)
}

async fn create_index(pool: &SqlitePool, index: &Index) -> Result<()> {
    let table = table_name_for_index(&index.name);
    let mut tx = pool.begin().await?;

    for field in &index.fields {
        sqlx::query(&format!(
            "INSERT INTO {} (index_name, index_type, index_settings, field_name, last_sequence) \
             VALUES (?, ?, ?, ?, 0)",
            METADATA_TABLE
        ))
        .bind(&index.name)
        .bind(index.index_type.as_str())
        .bind(&index.settings)
        .bind(field)
        .execute(&mut *tx)
        .await?;
    }

    match index.index_type {
        IndexType::Json => {
            let columns = index
                .fields
                .iter()
                .map(|f| format!("\"{}\" NONE", f))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!("CREATE TABLE \"{}\" ({})", table, columns))
                .execute(&mut *tx)
                .await?;

            let index_columns = index
                .fields
                .iter()
                .map(|f| format!("\"{}\"", f))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!(
                "CREATE INDEX \"{}_index\" ON \"{}\" ({})",
                table, table, index_columns
            ))
            .execute(&mut *tx)
            .await?;
        }
        IndexType::Text => {
            let mut columns = index
                .fields
                .iter()
                .map(|f| format!("\"{}\"", f))
                .collect::<Vec<_>>()
                .join(", ");
            if let Some(tokenizer) = &index.settings {
                columns.push_str(&format!(
                    ", tokenize = '{}'",
                    tokenizer.replace('\'', "''")
                ));
            }
            sqlx::query(&format!(
                "CREATE VIRTUAL TABLE \"{}\" USING fts5({})",
                table, columns
            ))
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Delete an index: its metadata rows and its shadow table
pub(crate) async fn delete_index(pool: &SqlitePool, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Index("Index name may not be empty".to_string()));
    }
    let mut tx = pool.begin().await?;
    let removed = sqlx::query(&format!(
        "DELETE FROM {} WHERE index_name = ?",
        METADATA_TABLE
    ))
    .bind(name)
    .execute(&mut *tx)
    .await?;
    if removed.rows_affected() == 0 {
        return Err(Error::Index(format!("Index \"{}\" does not exist", name)));
    }
    sqlx::query(&format!(
        "DROP TABLE IF EXISTS \"{}\"",
        table_name_for_index(name)
    ))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    info!("Deleted index \"{}\"", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_field_names() {
        assert!(valid_field_name("name"));
        assert!(valid_field_name("pet.species"));
        assert!(!valid_field_name("$name"));
        assert!(!valid_field_name("pet.$species"));
        assert!(!valid_field_name("a..b"));
    }

    #[test]
    fn test_prepare_prepends_rev_then_id() {
        let prepared = prepare_field_names(&["name".to_string(), "age".to_string()]).unwrap();
        assert_eq!(prepared, vec!["_id", "_rev", "name", "age"]);
    }

    #[test]
    fn test_prepare_does_not_duplicate_implicit_fields() {
        let prepared =
            prepare_field_names(&["_id".to_string(), "name".to_string()]).unwrap();
        assert_eq!(prepared, vec!["_rev", "_id", "name"]);
    }

    #[test]
    fn test_prepare_rejects_duplicates_and_bad_names() {
        assert!(prepare_field_names(&["a".to_string(), "a".to_string()]).is_err());
        assert!(prepare_field_names(&["$bad".to_string()]).is_err());
        assert!(prepare_field_names(&[]).is_err());
    }

    #[test]
    fn test_generated_names_are_stable() {
        let fields = vec!["_id".to_string(), "_rev".to_string(), "a".to_string()];
        assert_eq!(
            generated_name(IndexType::Json, &fields),
            generated_name(IndexType::Json, &fields)
        );
        assert_ne!(
            generated_name(IndexType::Json, &fields),
            generated_name(IndexType::Text, &fields)
        );
    }
}
