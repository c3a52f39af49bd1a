//! Query execution: set-merging, post-hoc matching, sort and projection
//!
//! A translated tree executes inside a single read transaction so every
//! leaf sees the same snapshot of the index database. AND nodes intersect
//! their children's id sets in order, OR nodes union them; ordering of the
//! first contributing leaf is preserved throughout. When the indexes do not
//! cover the query, every winning document is loaded and evaluated against
//! the selector in memory instead.

use crate::error::{Error, Result};
use crate::query::index::{table_name_for_index, Index};
use crate::query::matcher;
use crate::query::translator::{choose_index_for_fields, QueryNode};
use crate::query::{bind_argument, FindOptions, QueryResult, QueryRow, SortField};
use crate::store::DocumentStore;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const ID_CHUNK: usize = 500;

pub(crate) async fn find(
    store: &DocumentStore,
    pool: &SqlitePool,
    normalized: &Value,
    node: QueryNode,
    covered: bool,
    indexes: &[Index],
    options: FindOptions,
) -> Result<QueryResult> {
    // map of id -> (rev, body) collected on the post-hoc path, reused below
    let mut loaded: HashMap<String, (String, Value)> = HashMap::new();

    let mut ids: Vec<String> = if covered {
        let mut tx = pool.begin().await?;
        let ids = execute_node(&mut tx, &node).await?;
        tx.commit().await?;
        ids
    } else {
        debug!("Indexes do not cover the query, matching post hoc");
        let mut matched = Vec::new();
        for id in store.get_all_document_ids().await? {
            let doc = store.get_document(&id).await?;
            let mut body = doc.body_json()?;
            if let Some(object) = body.as_object_mut() {
                object.insert("_id".to_string(), json!(doc.id));
                object.insert("_rev".to_string(), json!(doc.rev.to_string()));
            }
            if matcher::matches(normalized, &body) {
                loaded.insert(id.clone(), (doc.rev.to_string(), body));
                matched.push(id);
            }
        }
        matched
    };

    if let Some(sort) = options.sort.as_ref().filter(|s| !s.is_empty()) {
        ids = sort_ids(pool, indexes, ids, sort).await?;
    }

    let limit = if options.limit == 0 {
        usize::MAX
    } else {
        options.limit
    };
    let ids: Vec<String> = ids.into_iter().skip(options.skip).take(limit).collect();

    // revisions: from the post-hoc load when available, else from an index
    let mut revs: HashMap<String, String> = loaded
        .iter()
        .map(|(id, (rev, _))| (id.clone(), rev.clone()))
        .collect();
    if revs.is_empty() && !ids.is_empty() {
        revs = fetch_columns(pool, indexes, &ids, &["_rev"])
            .await?
            .into_iter()
            .filter_map(|(id, mut values)| {
                values.remove("_rev").and_then(|v| match v {
                    Value::String(rev) => Some((id, rev)),
                    _ => None,
                })
            })
            .collect();
    }

    let projected: Option<HashMap<String, Map<String, Value>>> = match &options.fields {
        Some(fields) if !ids.is_empty() => {
            Some(project_fields(store, pool, indexes, &ids, fields, &loaded).await?)
        }
        Some(_) => Some(HashMap::new()),
        None => None,
    };

    let rows = ids
        .into_iter()
        .map(|id| {
            let rev = revs.get(&id).cloned().unwrap_or_default();
            let fields = projected.as_ref().map(|p| p.get(&id).cloned().unwrap_or_default());
            QueryRow { id, rev, fields }
        })
        .collect();
    Ok(QueryResult { rows })
}

/// Execute a node, yielding matching ids with first-seen ordering
fn execute_node<'a>(
    conn: &'a mut SqliteConnection,
    node: &'a QueryNode,
) -> BoxFuture<'a, Result<Vec<String>>> {
    Box::pin(async move {
        match node {
            QueryNode::Sql(parts) => {
                let mut query = sqlx::query(&parts.sql);
                for argument in &parts.args {
                    query = bind_argument(query, argument.clone());
                }
                let rows = query.fetch_all(&mut *conn).await?;
                let mut seen = HashSet::new();
                let mut ids = Vec::new();
                for row in &rows {
                    let id: String = row.get(0);
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
                Ok(ids)
            }
            QueryNode::And(children) => {
                let mut accumulated: Option<Vec<String>> = None;
                for child in children {
                    let child_ids = execute_node(conn, child).await?;
                    accumulated = Some(match accumulated {
                        None => child_ids,
                        Some(current) => {
                            let keep: HashSet<&String> = child_ids.iter().collect();
                            current.into_iter().filter(|id| keep.contains(id)).collect()
                        }
                    });
                }
                Ok(accumulated.unwrap_or_default())
            }
            QueryNode::Or(children) => {
                let mut seen = HashSet::new();
                let mut ids = Vec::new();
                for child in children {
                    for id in execute_node(conn, child).await? {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                }
                Ok(ids)
            }
        }
    })
}

/// Sort ids by field values drawn from an index covering the sort fields.
/// All fields sort ascending; a descending leading field reverses the list.
async fn sort_ids(
    pool: &SqlitePool,
    indexes: &[Index],
    ids: Vec<String>,
    sort: &[SortField],
) -> Result<Vec<String>> {
    let fields: Vec<&str> = sort.iter().map(|s| s.field.as_str()).collect();
    let needed: HashSet<&str> = fields.iter().copied().collect();
    if choose_index_for_fields(&needed, indexes).is_none() {
        return Err(Error::Query(format!(
            "Sort fields {:?} are not all covered by a single index",
            fields
        )));
    }

    let keys = fetch_columns(pool, indexes, &ids, &fields).await?;
    let mut sorted = ids;
    sorted.sort_by(|a, b| {
        let left = keys.get(a);
        let right = keys.get(b);
        for field in &fields {
            let lv = left.and_then(|m| m.get(*field)).unwrap_or(&Value::Null);
            let rv = right.and_then(|m| m.get(*field)).unwrap_or(&Value::Null);
            match sort_compare(lv, rv) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        std::cmp::Ordering::Equal
    });
    if sort[0].descending {
        sorted.reverse();
    }
    Ok(sorted)
}

/// Null < booleans < numbers < strings, mirroring the affinity-free shadow
/// column ordering closely enough for single-type fields
fn sort_compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Values of `fields` for each id, drawn from the first json index that
/// provides them (first shadow row per id wins)
async fn fetch_columns(
    pool: &SqlitePool,
    indexes: &[Index],
    ids: &[String],
    fields: &[&str],
) -> Result<HashMap<String, Map<String, Value>>> {
    let mut needed: HashSet<&str> = fields.iter().copied().collect();
    needed.insert("_id");
    // prefer a json index; a text index also stores its columns and can
    // serve a text-only store
    let index = choose_index_for_fields(&needed, indexes)
        .or_else(|| {
            indexes
                .iter()
                .find(|index| {
                    let provided: HashSet<&str> =
                        index.fields.iter().map(String::as_str).collect();
                    needed.iter().all(|f| provided.contains(f))
                })
                .cloned()
        })
        .ok_or_else(|| Error::Query(format!("No index provides fields {:?}", fields)))?;

    let columns = fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut conn = pool.acquire().await?;
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT \"_id\", {} FROM \"{}\" WHERE \"_id\" IN ({})",
            columns,
            table_name_for_index(&index.name),
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        for row in &rows {
            let id: String = row.get(0);
            out.entry(id).or_insert_with(|| {
                let mut values = Map::new();
                for (offset, field) in fields.iter().enumerate() {
                    values.insert(
                        field.to_string(),
                        column_to_json(row, offset + 1).unwrap_or(Value::Null),
                    );
                }
                values
            });
        }
    }
    Ok(out)
}

/// Projected fields per id: from a covering index when one exists, else
/// from the document bodies
async fn project_fields(
    store: &DocumentStore,
    pool: &SqlitePool,
    indexes: &[Index],
    ids: &[String],
    fields: &[String],
    loaded: &HashMap<String, (String, Value)>,
) -> Result<HashMap<String, Map<String, Value>>> {
    let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
    let needed: HashSet<&str> = refs.iter().copied().collect();

    if choose_index_for_fields(&needed, indexes).is_some() {
        return fetch_columns(pool, indexes, ids, &refs).await;
    }

    let mut out = HashMap::new();
    for id in ids {
        let body = match loaded.get(id) {
            Some((_, body)) => body.clone(),
            None => {
                let doc = store.get_document(id).await?;
                let mut body = doc.body_json()?;
                if let Some(object) = body.as_object_mut() {
                    object.insert("_id".to_string(), json!(doc.id));
                    object.insert("_rev".to_string(), json!(doc.rev.to_string()));
                }
                body
            }
        };
        let mut values = Map::new();
        for field in fields {
            values.insert(
                field.clone(),
                matcher::extract(&body, field).cloned().unwrap_or(Value::Null),
            );
        }
        out.insert(id.clone(), values);
    }
    Ok(out)
}

/// Decode a shadow column into JSON by its SQLite storage class
fn column_to_json(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "INTEGER" => json!(row.get::<i64, _>(index)),
        "REAL" => json!(row.get::<f64, _>(index)),
        "TEXT" => json!(row.get::<String, _>(index)),
        _ => Value::Null,
    })
}
