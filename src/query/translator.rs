//! Translation of selector maps into a tree of SQL index scans
//!
//! The translator is a depth-first recursive descent over the selector.
//! Inner nodes are AND/OR set operations performed in code; leaves are SQL
//! statements over a single shadow table each. Merging result sets in code
//! lets one query use several indexes, where SQLite alone would pick one.
//!
//! An `$and` of simple clauses needs a single index providing every
//! referenced field. `$or` clauses pick an index per clause. `$not` is
//! emitted as `_id NOT IN (subselect)` so documents with array-valued
//! fields behave correctly: a row per element means a plain `!=` would
//! match a document that also contains the negated value in another
//! element. `$size` never uses an index. An `$and` clause with no usable
//! index drops the whole query to the post-hoc scan plan; text search
//! strictly requires the text index, and every `$or` sub-clause must have
//! an index of its own or the query fails.

use crate::error::{Error, Result};
use crate::query::index::{table_name_for_index, Index, IndexType};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{info, warn};

/// A SQL argument with its SQLite storage class resolved.
///
/// Shadow-table writes and query bindings both go through this type, so a
/// value always compares against itself however it reached the database.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlArgument {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&Value> for SqlArgument {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlArgument::Null,
            Value::Bool(b) => SqlArgument::Integer(*b as i64),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlArgument::Integer(i),
                None => SqlArgument::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlArgument::Text(s.clone()),
            other => SqlArgument::Text(other.to_string()),
        }
    }
}

/// A SQL statement plus its bound arguments
#[derive(Debug, Clone)]
pub(crate) struct SqlParts {
    pub sql: String,
    pub args: Vec<SqlArgument>,
}

/// The executable form of a translated query
#[derive(Debug)]
pub(crate) enum QueryNode {
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Sql(SqlParts),
}

#[derive(Debug, Default)]
struct TranslatorState {
    at_least_one_index_used: bool,
    at_least_one_index_missing: bool,
    at_least_one_or_index_missing: bool,
    text_index_required: bool,
    text_index_missing: bool,
}

/// Normalize a selector into the canonical compound form:
/// a top-level `$and`/`$or` whose clauses are single-entry maps, with bare
/// values wrapped into `$eq` and `$ne`/`$nin` rewritten through `$not`.
pub(crate) fn normalize(selector: &Value) -> Result<Value> {
    let map = selector
        .as_object()
        .ok_or_else(|| Error::Query("Selector must be a JSON object".to_string()))?;

    if map.len() == 1 {
        if let Some((op, clauses)) = map.iter().next() {
            if op == "$and" || op == "$or" {
                let list = clauses.as_array().ok_or_else(|| {
                    Error::Query(format!("{} expects an array of clauses", op))
                })?;
                let normalized: Result<Vec<Value>> =
                    list.iter().map(normalize_clause).collect();
                let mut out = Map::new();
                out.insert(op.clone(), Value::Array(normalized?));
                return Ok(Value::Object(out));
            }
        }
    }

    // implicit $and over each field entry
    let mut clauses = Vec::with_capacity(map.len());
    for (field, predicate) in map {
        let mut clause = Map::new();
        clause.insert(field.clone(), predicate.clone());
        clauses.push(normalize_clause(&Value::Object(clause))?);
    }
    let mut out = Map::new();
    out.insert("$and".to_string(), Value::Array(clauses));
    Ok(Value::Object(out))
}

fn normalize_clause(clause: &Value) -> Result<Value> {
    let map = clause
        .as_object()
        .ok_or_else(|| Error::Query("Selector clause must be a JSON object".to_string()))?;
    let Some((key, value)) = map.iter().next().filter(|_| map.len() == 1) else {
        // {a: 1, b: 2} inside a clause list becomes a nested $and
        return normalize(clause);
    };

    if key == "$and" || key == "$or" {
        return normalize(clause);
    }
    if key == "$text" {
        return Ok(clause.clone());
    }
    if key.starts_with('$') {
        return Err(Error::Query(format!("Unknown operator {}", key)));
    }

    let predicate = normalize_predicate(value)?;
    let mut out = Map::new();
    out.insert(key.clone(), predicate);
    Ok(Value::Object(out))
}

fn normalize_predicate(value: &Value) -> Result<Value> {
    let Some(map) = value.as_object() else {
        // bare value: {"name": "mike"} means $eq
        let mut eq = Map::new();
        eq.insert("$eq".to_string(), value.clone());
        return Ok(Value::Object(eq));
    };
    let Some((op, operand)) = map
        .iter()
        .next()
        .filter(|_| map.len() == 1 && map.keys().all(|k| k.starts_with('$')))
    else {
        // an object without operators is an equality match on the object
        let mut eq = Map::new();
        eq.insert("$eq".to_string(), value.clone());
        return Ok(Value::Object(eq));
    };
    match op.as_str() {
        "$ne" => {
            let mut eq = Map::new();
            eq.insert("$eq".to_string(), operand.clone());
            let mut not = Map::new();
            not.insert("$not".to_string(), Value::Object(eq));
            Ok(Value::Object(not))
        }
        "$nin" => {
            let mut inner = Map::new();
            inner.insert("$in".to_string(), operand.clone());
            let mut not = Map::new();
            not.insert("$not".to_string(), Value::Object(inner));
            Ok(Value::Object(not))
        }
        "$not" => {
            let inner = normalize_predicate(operand)?;
            let mut not = Map::new();
            not.insert("$not".to_string(), inner);
            Ok(Value::Object(not))
        }
        "$eq" | "$gt" | "$gte" | "$lt" | "$lte" | "$in" | "$exists" | "$mod" | "$size"
        | "$type" | "$regex" => Ok(value.clone()),
        other => Err(Error::Query(format!("Unknown operator {}", other))),
    }
}

/// Translate a normalized selector. Returns the executable tree and whether
/// the chosen indexes fully cover the query; an uncovered query falls back
/// to the scan-everything post-hoc plan.
pub(crate) fn translate(selector: &Value, indexes: &[Index]) -> Result<(QueryNode, bool)> {
    let mut state = TranslatorState::default();
    let node = translate_compound(selector, indexes, &mut state)?;

    if state.text_index_missing {
        return Err(Error::Query(
            "No text index defined, cannot execute query containing a text search".to_string(),
        ));
    }
    if state.text_index_required && state.at_least_one_index_missing {
        return Err(Error::Query(
            "Query contains a text search but is missing json indexes; all indexes must \
             exist to execute a query containing a text search"
                .to_string(),
        ));
    }
    if state.at_least_one_or_index_missing {
        // $and clauses may fall back to the post-hoc scan, but every $or
        // sub-clause must be served by an index
        return Err(Error::Query(
            "An $or clause references fields with no usable index; create an index for \
             every $or sub-clause and re-execute"
                .to_string(),
        ));
    }
    if !state.text_index_required && !state.at_least_one_index_used {
        // no single index was usable: every document id must be considered
        // so the post-hoc matcher can run
        return Ok((node, false));
    }
    Ok((node, !state.at_least_one_index_missing))
}

fn translate_compound(
    selector: &Value,
    indexes: &[Index],
    state: &mut TranslatorState,
) -> Result<QueryNode> {
    let map = selector
        .as_object()
        .ok_or_else(|| Error::Query("Selector must be a JSON object".to_string()))?;
    let (is_and, clauses) = if let Some(clauses) = map.get("$and") {
        (true, clauses)
    } else if let Some(clauses) = map.get("$or") {
        (false, clauses)
    } else {
        return Err(Error::Query("Selector has no top-level $and or $or".to_string()));
    };
    let clauses = clauses
        .as_array()
        .ok_or_else(|| Error::Query("Compound clause list must be an array".to_string()))?;

    let basic: Vec<&Value> = clauses
        .iter()
        .filter(|clause| clause_field(clause).is_some_and(|f| !f.starts_with('$')))
        .collect();
    let text: Option<&Value> = clauses
        .iter()
        .find(|clause| clause_field(clause) == Some("$text"));

    let mut children = Vec::new();

    if !basic.is_empty() {
        if is_and {
            // one compound index must provide every referenced field
            match choose_index_for_and_clause(&basic, indexes) {
                Some(index) => {
                    state.at_least_one_index_used = true;
                    children.push(QueryNode::Sql(select_for_and_clause(&basic, &index)?));
                }
                None => {
                    state.at_least_one_index_missing = true;
                    warn!(
                        "No single index contains all of {:?}; add an index for these \
                         fields to query efficiently",
                        fields_for_clause(&basic)
                    );
                }
            }
        } else {
            // each OR branch may use its own index
            for clause in &basic {
                let single = vec![*clause];
                match choose_index_for_and_clause(&single, indexes) {
                    Some(index) => {
                        state.at_least_one_index_used = true;
                        children.push(QueryNode::Sql(select_for_and_clause(&single, &index)?));
                    }
                    None => {
                        state.at_least_one_index_missing = true;
                        state.at_least_one_or_index_missing = true;
                    }
                }
            }
        }
    }

    if let Some(text_clause) = text {
        state.text_index_required = true;
        match indexes.iter().find(|i| i.index_type == IndexType::Text) {
            Some(index) => {
                state.at_least_one_index_used = true;
                children.push(QueryNode::Sql(select_for_text_clause(text_clause, index)?));
            }
            None => state.text_index_missing = true,
        }
    }

    // nested compounds, OR before AND for predictable child ordering
    for op in ["$or", "$and"] {
        for clause in clauses {
            if clause_field(clause) == Some(op) {
                children.push(translate_compound(clause, indexes, state)?);
            }
        }
    }

    Ok(if is_and {
        QueryNode::And(children)
    } else {
        QueryNode::Or(children)
    })
}

fn clause_field(clause: &Value) -> Option<&str> {
    clause.as_object()?.keys().next().map(String::as_str)
}

fn fields_for_clause<'a>(clause: &[&'a Value]) -> Vec<&'a str> {
    clause.iter().filter_map(|c| clause_field(c)).collect()
}

fn clause_uses_operator(clause: &[&Value], operator: &str) -> bool {
    clause.iter().any(|component| {
        component
            .as_object()
            .and_then(|map| map.values().next())
            .and_then(Value::as_object)
            .map(|predicate| {
                predicate.contains_key(operator)
                    || predicate
                        .get("$not")
                        .and_then(Value::as_object)
                        .is_some_and(|inner| inner.contains_key(operator))
            })
            .unwrap_or(false)
    })
}

/// The first json index providing every field the clause references
fn choose_index_for_and_clause(clause: &[&Value], indexes: &[Index]) -> Option<Index> {
    if clause.is_empty() || indexes.is_empty() {
        return None;
    }
    // $size compares array lengths and shadow rows are per-element;
    // $type and $regex have no SQL rendering. None of them can use an
    // index, so their clauses go to the post-hoc matcher.
    for operator in ["$size", "$type", "$regex"] {
        if clause_uses_operator(clause, operator) {
            info!(
                "{} operator found in clause; indexes are not used with {}",
                operator, operator
            );
            return None;
        }
    }
    let needed: HashSet<&str> = fields_for_clause(clause).into_iter().collect();
    choose_index_for_fields(&needed, indexes)
}

pub(crate) fn choose_index_for_fields(
    needed: &HashSet<&str>,
    indexes: &[Index],
) -> Option<Index> {
    indexes
        .iter()
        .filter(|index| index.index_type != IndexType::Text)
        .find(|index| {
            let provided: HashSet<&str> = index.fields.iter().map(String::as_str).collect();
            needed.iter().all(|f| provided.contains(f))
        })
        .cloned()
}

fn select_for_and_clause(clause: &[&Value], index: &Index) -> Result<SqlParts> {
    let where_parts = where_for_and_clause(clause, &index.name)?;
    Ok(SqlParts {
        sql: format!(
            "SELECT _id FROM \"{}\" WHERE {}",
            table_name_for_index(&index.name),
            where_parts.sql
        ),
        args: where_parts.args,
    })
}

fn select_for_text_clause(clause: &Value, index: &Index) -> Result<SqlParts> {
    let search = clause
        .get("$text")
        .and_then(|t| t.get("$search"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::Query("$text requires a {\"$search\": <string>} operand".to_string())
        })?;
    let table = table_name_for_index(&index.name);
    Ok(SqlParts {
        sql: format!("SELECT _id FROM \"{}\" WHERE \"{}\" MATCH ?", table, table),
        args: vec![SqlArgument::Text(search.to_string())],
    })
}

fn where_for_and_clause(clause: &[&Value], index_name: &str) -> Result<SqlParts> {
    let mut predicates = Vec::new();
    let mut args = Vec::new();

    for component in clause {
        let (field, predicate) = single_entry(component).ok_or_else(|| {
            Error::Query(format!("Expected single predicate per clause, got {}", component))
        })?;
        let (operator, operand) = single_entry(predicate).ok_or_else(|| {
            Error::Query(format!("Expected single operator per predicate, got {}", component))
        })?;

        if operator == "$not" {
            let (inner_op, inner_operand) = single_entry(operand).ok_or_else(|| {
                Error::Query(format!("Expected single operator under $not, got {}", component))
            })?;
            if inner_op == "$exists" {
                let exists = !inner_operand.as_bool().unwrap_or(false);
                predicates.push(exists_clause(field, exists));
            } else {
                let (operand_sql, mut operand_args) = operand_placeholder(inner_op, inner_operand)?;
                let sub_select = format!(
                    "SELECT _id FROM \"{}\" WHERE \"{}\" {} {}",
                    table_name_for_index(index_name),
                    field,
                    sql_operator(inner_op)?,
                    operand_sql
                );
                predicates.push(format!("_id NOT IN ({})", sub_select));
                args.append(&mut operand_args);
            }
        } else if operator == "$exists" {
            let exists = operand.as_bool().unwrap_or(false);
            predicates.push(exists_clause(field, exists));
        } else {
            let (operand_sql, mut operand_args) = operand_placeholder(operator, operand)?;
            predicates.push(format!(
                "\"{}\" {} {}",
                field,
                sql_operator(operator)?,
                operand_sql
            ));
            args.append(&mut operand_args);
        }
    }

    Ok(SqlParts {
        sql: predicates.join(" AND "),
        args,
    })
}

/// The sole `(key, value)` entry of a single-entry JSON object
fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object().filter(|m| m.len() == 1)?;
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

fn exists_clause(field: &str, exists: bool) -> String {
    if exists {
        format!("(\"{}\" IS NOT NULL)", field)
    } else {
        format!("(\"{}\" IS NULL)", field)
    }
}

fn sql_operator(operator: &str) -> Result<&'static str> {
    Ok(match operator {
        "$eq" => "=",
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        "$lte" => "<=",
        "$in" => "IN",
        "$mod" => "%",
        other => {
            return Err(Error::Query(format!(
                "Operator {} cannot be translated to SQL",
                other
            )))
        }
    })
}

/// Placeholder text and arguments for one operand. `$in` expands to a
/// parenthesized placeholder list; `$mod [divisor, remainder]` becomes
/// `% CAST(? AS INTEGER) = ?`.
fn operand_placeholder(operator: &str, operand: &Value) -> Result<(String, Vec<SqlArgument>)> {
    match operator {
        "$in" => {
            let values = operand.as_array().ok_or_else(|| {
                Error::Query("$in expects an array operand".to_string())
            })?;
            let placeholders = vec!["?"; values.len()].join(", ");
            let args = values.iter().map(SqlArgument::from).collect();
            Ok((format!("( {} )", placeholders), args))
        }
        "$mod" => {
            let pair = operand
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| {
                    Error::Query("$mod expects a [divisor, remainder] operand".to_string())
                })?;
            Ok((
                "CAST(? AS INTEGER) = ?".to_string(),
                vec![SqlArgument::from(&pair[0]), SqlArgument::from(&pair[1])],
            ))
        }
        _ => Ok(("?".to_string(), vec![SqlArgument::from(operand)])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index(name: &str, fields: &[&str]) -> Index {
        let mut all = vec!["_id".to_string(), "_rev".to_string()];
        all.extend(fields.iter().map(|f| f.to_string()));
        Index {
            name: name.to_string(),
            index_type: IndexType::Json,
            fields: all,
            settings: None,
        }
    }

    fn sql_leaves(node: &QueryNode) -> Vec<&SqlParts> {
        match node {
            QueryNode::Sql(parts) => vec![parts],
            QueryNode::And(children) | QueryNode::Or(children) => {
                children.iter().flat_map(sql_leaves).collect()
            }
        }
    }

    #[test]
    fn test_normalize_wraps_bare_fields_into_and_eq() {
        let normalized = normalize(&json!({"name": "mike", "age": 12})).unwrap();
        assert_eq!(
            normalized,
            json!({"$and": [{"name": {"$eq": "mike"}}, {"age": {"$eq": 12}}]})
        );
    }

    #[test]
    fn test_normalize_rewrites_ne_and_nin_through_not() {
        let normalized = normalize(&json!({"age": {"$ne": 12}})).unwrap();
        assert_eq!(normalized, json!({"$and": [{"age": {"$not": {"$eq": 12}}}]}));

        let normalized = normalize(&json!({"age": {"$nin": [1, 2]}})).unwrap();
        assert_eq!(
            normalized,
            json!({"$and": [{"age": {"$not": {"$in": [1, 2]}}}]})
        );
    }

    #[test]
    fn test_normalize_rejects_unknown_operators() {
        assert!(normalize(&json!({"age": {"$near": 12}})).is_err());
        assert!(normalize(&json!({"$xor": []})).is_err());
    }

    #[test]
    fn test_and_clause_uses_single_compound_index() {
        let indexes = vec![index("name_age", &["name", "age"])];
        let selector =
            normalize(&json!({"$and": [{"name": {"$eq": "mike"}}, {"age": {"$gt": 30}}]}))
                .unwrap();
        let (node, covered) = translate(&selector, &indexes).unwrap();
        assert!(covered);

        let leaves = sql_leaves(&node);
        assert_eq!(leaves.len(), 1);
        assert_eq!(
            leaves[0].sql,
            "SELECT _id FROM \"_t_name_age\" WHERE \"name\" = ? AND \"age\" > ?"
        );
        assert_eq!(
            leaves[0].args,
            vec![
                SqlArgument::Text("mike".to_string()),
                SqlArgument::Integer(30)
            ]
        );
    }

    #[test]
    fn test_or_with_unindexed_sub_clause_errors() {
        // name is indexed, age is not: the whole query must fail rather
        // than degrade to a scan
        let indexes = vec![index("by_name", &["name"])];
        let selector =
            normalize(&json!({"$or": [{"name": {"$eq": "mike"}}, {"age": {"$eq": 12}}]}))
                .unwrap();
        let err = translate(&selector, &indexes).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn test_or_clauses_pick_separate_indexes() {
        let indexes = vec![index("by_name", &["name"]), index("by_age", &["age"])];
        let selector =
            normalize(&json!({"$or": [{"name": {"$eq": "mike"}}, {"age": {"$eq": 12}}]}))
                .unwrap();
        let (node, covered) = translate(&selector, &indexes).unwrap();
        assert!(covered);
        assert!(matches!(node, QueryNode::Or(_)));

        let leaves = sql_leaves(&node);
        assert_eq!(leaves.len(), 2);
        assert!(leaves[0].sql.contains("_t_by_name"));
        assert!(leaves[1].sql.contains("_t_by_age"));
    }

    #[test]
    fn test_not_emits_sub_select() {
        let indexes = vec![index("by_age", &["age"])];
        let selector = normalize(&json!({"age": {"$ne": 12}})).unwrap();
        let (node, covered) = translate(&selector, &indexes).unwrap();
        assert!(covered);
        let leaves = sql_leaves(&node);
        assert_eq!(
            leaves[0].sql,
            "SELECT _id FROM \"_t_by_age\" WHERE _id NOT IN \
             (SELECT _id FROM \"_t_by_age\" WHERE \"age\" = ?)"
        );
    }

    #[test]
    fn test_in_expands_placeholders() {
        let indexes = vec![index("by_age", &["age"])];
        let selector = normalize(&json!({"age": {"$in": [1, 2, 3]}})).unwrap();
        let (node, _) = translate(&selector, &indexes).unwrap();
        let leaves = sql_leaves(&node);
        assert_eq!(
            leaves[0].sql,
            "SELECT _id FROM \"_t_by_age\" WHERE \"age\" IN ( ?, ?, ? )"
        );
        assert_eq!(leaves[0].args.len(), 3);
    }

    #[test]
    fn test_mod_casts_divisor() {
        let indexes = vec![index("by_age", &["age"])];
        let selector = normalize(&json!({"age": {"$mod": [10, 2]}})).unwrap();
        let (node, _) = translate(&selector, &indexes).unwrap();
        let leaves = sql_leaves(&node);
        assert_eq!(
            leaves[0].sql,
            "SELECT _id FROM \"_t_by_age\" WHERE \"age\" % CAST(? AS INTEGER) = ?"
        );
        assert_eq!(
            leaves[0].args,
            vec![SqlArgument::Integer(10), SqlArgument::Integer(2)]
        );
    }

    #[test]
    fn test_missing_index_falls_back_to_scan() {
        let indexes = vec![index("by_name", &["name"])];
        let selector = normalize(&json!({"age": {"$eq": 12}})).unwrap();
        let (_, covered) = translate(&selector, &indexes).unwrap();
        assert!(!covered);
    }

    #[test]
    fn test_size_never_uses_an_index() {
        let indexes = vec![index("by_pets", &["pets"])];
        let selector = normalize(&json!({"pets": {"$size": 2}})).unwrap();
        let (_, covered) = translate(&selector, &indexes).unwrap();
        assert!(!covered);
    }

    #[test]
    fn test_regex_and_type_fall_back_to_post_hoc() {
        let indexes = vec![index("by_name", &["name"])];
        let selector = normalize(&json!({"name": {"$regex": "^mi"}})).unwrap();
        let (_, covered) = translate(&selector, &indexes).unwrap();
        assert!(!covered);

        let selector = normalize(&json!({"name": {"$type": "string"}})).unwrap();
        let (_, covered) = translate(&selector, &indexes).unwrap();
        assert!(!covered);
    }

    #[test]
    fn test_text_search_without_text_index_errors() {
        let indexes = vec![index("by_name", &["name"])];
        let selector = json!({"$and": [{"$text": {"$search": "fish"}}]});
        assert!(translate(&selector, &indexes).is_err());
    }

    #[test]
    fn test_text_search_uses_match() {
        let mut indexes = vec![index("by_name", &["name"])];
        indexes.push(Index {
            name: "fulltext".to_string(),
            index_type: IndexType::Text,
            fields: vec!["_id".to_string(), "_rev".to_string(), "body".to_string()],
            settings: None,
        });
        let selector = json!({"$and": [{"$text": {"$search": "fish"}}]});
        let (node, covered) = translate(&selector, &indexes).unwrap();
        assert!(covered);
        let leaves = sql_leaves(&node);
        assert_eq!(
            leaves[0].sql,
            "SELECT _id FROM \"_t_fulltext\" WHERE \"_t_fulltext\" MATCH ?"
        );
    }

    #[test]
    fn test_nested_compound_builds_tree() {
        let indexes = vec![index("by_name", &["name"]), index("by_age", &["age"])];
        let selector = normalize(&json!({
            "$and": [
                {"$or": [{"name": {"$eq": "mike"}}, {"name": {"$eq": "fred"}}]},
                {"age": {"$gt": 30}}
            ]
        }))
        .unwrap();
        let (node, covered) = translate(&selector, &indexes).unwrap();
        assert!(covered);
        let QueryNode::And(children) = node else {
            panic!("expected AND root")
        };
        // SQL leaf for the age clause plus the nested OR node
        assert_eq!(children.len(), 2);
        assert!(matches!(children[1], QueryNode::Or(_)));
    }
}
