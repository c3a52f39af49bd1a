//! Ad-hoc queries over an indexed document store
//!
//! The query engine owns its own relational database under
//! `extensions/com.cloudant.sync.query/`, holding one shadow table per
//! index plus a metadata table. Queries are selector maps compiled into a
//! tree of per-index SQL scans merged in code; predicates no index can
//! serve fall back to an in-memory matcher over every winning revision.

mod executor;
pub mod index;
mod matcher;
mod translator;
mod updater;

use crate::error::Result;
use crate::store::{DocumentStore, EXTENSIONS_DIR};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub use index::{Index, IndexType};
use translator::SqlArgument;

/// Extension directory owned by the query engine
pub const QUERY_EXTENSION: &str = "com.cloudant.sync.query";

/// File name of the index database inside the extension directory
pub const INDEXES_DB_FILE: &str = "indexes.sync";

/// Metadata table tracking index definitions and their update progress
pub(crate) const METADATA_TABLE: &str = "_t_cloudant_sync_query_metadata";

const QUERY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _t_cloudant_sync_query_metadata (
    index_name TEXT NOT NULL,
    index_type TEXT NOT NULL,
    index_settings TEXT,
    field_name TEXT NOT NULL,
    last_sequence INTEGER NOT NULL DEFAULT 0
);
"#;

/// One sort key of a query
#[derive(Debug, Clone)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// Options applied after set-merging: paging, projection and ordering
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: usize,
    /// 0 means unlimited
    pub limit: usize,
    /// Fields to project; None returns ids and revs only
    pub fields: Option<Vec<String>>,
    pub sort: Option<Vec<SortField>>,
}

/// One matching document
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub id: String,
    pub rev: String,
    /// Projected field values when the query requested them
    pub fields: Option<Map<String, Value>>,
}

/// An executed query's matches, in plan order
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().map(|row| row.id.as_str()).collect()
    }
}

/// Entry point for index management and queries over one store
pub struct QueryManager {
    store: Arc<DocumentStore>,
    pool: SqlitePool,
}

impl QueryManager {
    /// Open (creating if needed) the index database for a store
    pub async fn open(store: Arc<DocumentStore>) -> Result<Self> {
        let dir: PathBuf = store.path().join(EXTENSIONS_DIR).join(QUERY_EXTENSION);
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join(INDEXES_DB_FILE);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Opening query index database at {:?}", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(QUERY_SCHEMA).execute(&pool).await?;

        Ok(Self { store, pool })
    }

    /// Create a json index over `fields`, generating a name when none given
    pub async fn create_json_index(
        &self,
        fields: &[String],
        name: Option<&str>,
    ) -> Result<Index> {
        let created =
            index::ensure_indexed(&self.pool, fields, name, IndexType::Json, None).await?;
        updater::update_index(&self.store, &self.pool, &created).await?;
        Ok(created)
    }

    /// Create the store's text index; at most one may exist
    pub async fn create_text_index(
        &self,
        fields: &[String],
        name: Option<&str>,
        tokenizer: Option<&str>,
    ) -> Result<Index> {
        let created =
            index::ensure_indexed(&self.pool, fields, name, IndexType::Text, tokenizer).await?;
        updater::update_index(&self.store, &self.pool, &created).await?;
        Ok(created)
    }

    /// All defined indexes
    pub async fn list_indexes(&self) -> Result<Vec<Index>> {
        let mut conn = self.pool.acquire().await?;
        index::list_indexes(&mut conn).await
    }

    /// Delete an index and its shadow table
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        index::delete_index(&self.pool, name).await
    }

    /// Bring every index up to the store's current sequence
    pub async fn refresh_all_indexes(&self) -> Result<()> {
        updater::update_all_indexes(&self.store, &self.pool).await
    }

    /// Whether the underlying SQLite can serve text indexes
    pub async fn is_text_search_enabled(&self) -> Result<bool> {
        index::text_search_available(&self.pool).await
    }

    /// Execute a selector with default options
    pub async fn find(&self, selector: &Value) -> Result<QueryResult> {
        self.find_with(selector, FindOptions::default()).await
    }

    /// Execute a selector with paging, projection and sort
    pub async fn find_with(
        &self,
        selector: &Value,
        options: FindOptions,
    ) -> Result<QueryResult> {
        let normalized = translator::normalize(selector)?;
        self.refresh_all_indexes().await?;
        let indexes = self.list_indexes().await?;
        let (node, covered) = translator::translate(&normalized, &indexes)?;
        executor::find(
            &self.store,
            &self.pool,
            &normalized,
            node,
            covered,
            &indexes,
            options,
        )
        .await
    }

    /// Release the index database connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Bind one resolved argument onto a query
pub(crate) fn bind_argument<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    argument: SqlArgument,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match argument {
        SqlArgument::Null => query.bind(None::<i64>),
        SqlArgument::Integer(i) => query.bind(i),
        SqlArgument::Real(f) => query.bind(f),
        SqlArgument::Text(s) => query.bind(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    async fn manager_with_docs(docs: &[(&str, Value)]) -> (tempfile::TempDir, QueryManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path().join("store")).await.unwrap());
        for (id, body) in docs {
            store
                .create_document(Some(id), &serde_json::to_vec(body).unwrap(), Vec::new())
                .await
                .unwrap();
        }
        let manager = QueryManager::open(store).await.unwrap();
        (dir, manager)
    }

    fn people() -> Vec<(&'static str, Value)> {
        vec![
            ("mike12", json!({"name": "mike", "age": 12, "pets": ["cat", "dog"]})),
            ("mike34", json!({"name": "mike", "age": 34, "pets": ["parrot"]})),
            ("fred43", json!({"name": "fred", "age": 43})),
            ("jane21", json!({"name": "jane", "age": 21, "pets": ["dog"]})),
        ]
    }

    #[tokio::test]
    async fn test_find_with_compound_index() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["name".to_string(), "age".to_string()], Some("name_age"))
            .await
            .unwrap();

        let result = manager
            .find(&json!({"$and": [{"name": {"$eq": "mike"}}, {"age": {"$gt": 30}}]}))
            .await
            .unwrap();
        assert_eq!(result.ids(), vec!["mike34"]);
        assert!(!result.rows[0].rev.is_empty());
    }

    #[tokio::test]
    async fn test_find_reflects_later_changes() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["age".to_string()], Some("by_age"))
            .await
            .unwrap();

        let before = manager.find(&json!({"age": {"$gt": 40}})).await.unwrap();
        assert_eq!(before.ids(), vec!["fred43"]);

        let fred = manager.store.get_document("fred43").await.unwrap();
        manager
            .store
            .update_document(
                "fred43",
                &fred.rev.to_string(),
                br#"{"name":"fred","age":18}"#,
                Vec::new(),
            )
            .await
            .unwrap();

        // the next find refreshes the index before executing
        let after = manager.find(&json!({"age": {"$gt": 40}})).await.unwrap();
        assert!(after.rows.is_empty());
    }

    #[tokio::test]
    async fn test_eq_over_array_members() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["pets".to_string()], Some("by_pets"))
            .await
            .unwrap();

        let result = manager.find(&json!({"pets": {"$eq": "dog"}})).await.unwrap();
        let mut ids = result.ids();
        ids.sort();
        assert_eq!(ids, vec!["jane21", "mike12"]);
    }

    #[tokio::test]
    async fn test_or_uses_separate_indexes() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();
        manager
            .create_json_index(&["age".to_string()], Some("by_age"))
            .await
            .unwrap();

        let result = manager
            .find(&json!({"$or": [{"name": {"$eq": "fred"}}, {"age": {"$lt": 20}}]}))
            .await
            .unwrap();
        let mut ids = result.ids();
        ids.sort();
        assert_eq!(ids, vec!["fred43", "mike12"]);
    }

    #[tokio::test]
    async fn test_or_with_unindexed_sub_clause_fails() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();

        // age has no index: an $or may not degrade to the post-hoc scan
        let err = manager
            .find(&json!({"$or": [{"name": {"$eq": "fred"}}, {"age": {"$lt": 20}}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn test_ne_excludes_array_documents_entirely() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["pets".to_string()], Some("by_pets"))
            .await
            .unwrap();

        // mike12 owns a cat, so $ne cat must exclude him even though he
        // also owns a dog
        let result = manager.find(&json!({"pets": {"$ne": "cat"}})).await.unwrap();
        assert!(!result.ids().contains(&"mike12"));
        assert!(result.ids().contains(&"jane21"));
    }

    #[tokio::test]
    async fn test_post_hoc_fallback_without_index() {
        let (_dir, manager) = manager_with_docs(&people()).await;

        let result = manager
            .find(&json!({"name": {"$eq": "mike"}, "age": {"$lt": 20}}))
            .await
            .unwrap();
        assert_eq!(result.ids(), vec!["mike12"]);
    }

    #[tokio::test]
    async fn test_post_hoc_matches_indexed_results() {
        let docs = people();
        let selector = json!({"age": {"$gte": 21}});

        let (_dir, without_index) = manager_with_docs(&docs).await;
        let mut scan_ids: Vec<String> = without_index
            .find(&selector)
            .await
            .unwrap()
            .ids()
            .iter()
            .map(|s| s.to_string())
            .collect();
        scan_ids.sort();

        let (_dir2, with_index) = manager_with_docs(&docs).await;
        with_index
            .create_json_index(&["age".to_string()], Some("by_age"))
            .await
            .unwrap();
        let mut index_ids: Vec<String> = with_index
            .find(&selector)
            .await
            .unwrap()
            .ids()
            .iter()
            .map(|s| s.to_string())
            .collect();
        index_ids.sort();

        assert_eq!(scan_ids, index_ids);
    }

    #[tokio::test]
    async fn test_sort_skip_limit_and_projection() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["age".to_string(), "name".to_string()], Some("age_name"))
            .await
            .unwrap();

        let options = FindOptions {
            skip: 1,
            limit: 2,
            fields: Some(vec!["age".to_string()]),
            sort: Some(vec![SortField {
                field: "age".to_string(),
                descending: false,
            }]),
        };
        let result = manager
            .find_with(&json!({"age": {"$gt": 0}}), options)
            .await
            .unwrap();
        // ages ascending: 12, 21, 34, 43 -> skip 1, take 2 -> 21, 34
        assert_eq!(result.ids(), vec!["jane21", "mike34"]);
        let fields = result.rows[0].fields.as_ref().unwrap();
        assert_eq!(fields["age"], json!(21));

        let descending = FindOptions {
            sort: Some(vec![SortField {
                field: "age".to_string(),
                descending: true,
            }]),
            ..Default::default()
        };
        let result = manager
            .find_with(&json!({"age": {"$gt": 0}}), descending)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec!["fred43", "mike34", "jane21", "mike12"]);
    }

    #[tokio::test]
    async fn test_sort_requires_covering_index() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["age".to_string()], Some("by_age"))
            .await
            .unwrap();

        let options = FindOptions {
            sort: Some(vec![SortField {
                field: "name".to_string(),
                descending: false,
            }]),
            ..Default::default()
        };
        assert!(manager
            .find_with(&json!({"age": {"$gt": 0}}), options)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_index_lifecycle() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        let created = manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();
        assert_eq!(created.fields, vec!["_id", "_rev", "name"]);

        // same name and definition: fine; different definition: error
        manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();
        let err = manager
            .create_json_index(&["age".to_string()], Some("by_name"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Index(_)));

        assert_eq!(manager.list_indexes().await.unwrap().len(), 1);
        manager.delete_index("by_name").await.unwrap();
        assert!(manager.list_indexes().await.unwrap().is_empty());
        assert!(manager.delete_index("by_name").await.is_err());
    }

    #[tokio::test]
    async fn test_generated_index_names() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        let index = manager
            .create_json_index(&["name".to_string()], None)
            .await
            .unwrap();
        assert!(index.name.starts_with("satchel.query.GeneratedIndexName."));

        // asking again with the same definition reuses the index
        let again = manager
            .create_json_index(&["name".to_string()], None)
            .await
            .unwrap();
        assert_eq!(index.name, again.name);
        assert_eq!(manager.list_indexes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_text_search_requires_text_index() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();
        let err = manager
            .find(&json!({"$and": [{"$text": {"$search": "mike"}}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn test_text_index_and_match_query() {
        let docs = vec![
            ("n1", json!({"title": "a note about fish"})),
            ("n2", json!({"title": "a note about birds"})),
        ];
        let (_dir, manager) = manager_with_docs(&docs).await;
        if !manager.is_text_search_enabled().await.unwrap() {
            return;
        }

        manager
            .create_text_index(&["title".to_string()], Some("fulltext"), None)
            .await
            .unwrap();
        let result = manager
            .find(&json!({"$and": [{"$text": {"$search": "fish"}}]}))
            .await
            .unwrap();
        assert_eq!(result.ids(), vec!["n1"]);

        // one text index per store
        let err = manager
            .create_text_index(&["title".to_string()], Some("other"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Index(_)));
    }

    #[tokio::test]
    async fn test_deleted_documents_leave_the_index() {
        let (_dir, manager) = manager_with_docs(&people()).await;
        manager
            .create_json_index(&["name".to_string()], Some("by_name"))
            .await
            .unwrap();

        let fred = manager.store.get_document("fred43").await.unwrap();
        manager
            .store
            .delete_document("fred43", &fred.rev.to_string())
            .await
            .unwrap();

        let result = manager.find(&json!({"name": {"$eq": "fred"}})).await.unwrap();
        assert!(result.rows.is_empty());
    }
}
