//! In-memory selector evaluation
//!
//! Used when no index covers a query: every candidate document is loaded
//! and checked against the normalized selector. Semantics mirror the
//! indexed plan, in particular the array rule: a predicate on a field whose
//! value is an array holds when any element satisfies it, matching the
//! per-element rows the index updater writes. `$size` applies to the array
//! itself.

use regex::Regex;
use serde_json::Value;

/// Does a document (body with `_id`/`_rev` injected) match a normalized
/// selector? Unknown shapes never match.
pub(crate) fn matches(selector: &Value, doc: &Value) -> bool {
    let Some(map) = selector.as_object() else {
        return false;
    };
    if let Some(clauses) = map.get("$and").and_then(Value::as_array) {
        return clauses.iter().all(|clause| clause_matches(clause, doc));
    }
    if let Some(clauses) = map.get("$or").and_then(Value::as_array) {
        return clauses.iter().any(|clause| clause_matches(clause, doc));
    }
    false
}

fn clause_matches(clause: &Value, doc: &Value) -> bool {
    let Some(map) = clause.as_object().filter(|m| m.len() == 1) else {
        return false;
    };
    let Some((key, value)) = map.iter().next() else {
        return false;
    };
    match key.as_str() {
        "$and" | "$or" => matches(clause, doc),
        // text search cannot be evaluated post hoc; the translator rejects
        // such queries before this plan is ever chosen
        "$text" => false,
        field => {
            let Some(predicate) = value.as_object().filter(|p| p.len() == 1) else {
                return false;
            };
            let Some((op, operand)) = predicate.iter().next() else {
                return false;
            };
            field_matches(doc, field, op, operand)
        }
    }
}

fn field_matches(doc: &Value, field: &str, op: &str, operand: &Value) -> bool {
    let extracted = extract(doc, field);
    match op {
        "$not" => {
            let Some(inner) = operand.as_object().filter(|p| p.len() == 1) else {
                return false;
            };
            let Some((inner_op, inner_operand)) = inner.iter().next() else {
                return false;
            };
            !field_matches(doc, field, inner_op, inner_operand)
        }
        "$exists" => {
            let wanted = operand.as_bool().unwrap_or(false);
            extracted.is_some() == wanted
        }
        "$size" => match extracted {
            Some(Value::Array(items)) => {
                operand.as_u64().is_some_and(|n| items.len() as u64 == n)
            }
            _ => false,
        },
        "$type" => {
            let Some(value) = extracted else { return false };
            operand.as_str().is_some_and(|t| type_name(value) == t)
        }
        _ => {
            let Some(value) = extracted else { return false };
            // array fields match when any element does
            if let Value::Array(items) = value {
                if items.iter().any(|item| scalar_matches(item, op, operand)) {
                    return true;
                }
            }
            scalar_matches(value, op, operand)
        }
    }
}

fn scalar_matches(value: &Value, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => value == operand,
        "$gt" => compare(value, operand).is_some_and(|o| o == std::cmp::Ordering::Greater),
        "$gte" => compare(value, operand).is_some_and(|o| o != std::cmp::Ordering::Less),
        "$lt" => compare(value, operand).is_some_and(|o| o == std::cmp::Ordering::Less),
        "$lte" => compare(value, operand).is_some_and(|o| o != std::cmp::Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| candidates.contains(value)),
        "$mod" => {
            let Some(pair) = operand.as_array().filter(|a| a.len() == 2) else {
                return false;
            };
            let (Some(divisor), Some(remainder)) = (pair[0].as_i64(), pair[1].as_i64()) else {
                return false;
            };
            if divisor == 0 {
                return false;
            }
            // SQLite % truncates toward zero; mirror that
            value.as_i64().is_some_and(|v| v % divisor == remainder)
        }
        "$regex" => {
            let (Some(text), Some(pattern)) = (value.as_str(), operand.as_str()) else {
                return false;
            };
            Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false)
        }
        _ => false,
    }
}

/// Total order on comparable JSON scalars; incomparable pairs yield None
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Value at a dot-separated path
pub(crate) fn extract<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = doc;
    for segment in path.split('.') {
        cursor = cursor.as_object()?.get(segment)?;
    }
    Some(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::translator::normalize;
    use serde_json::json;

    fn check(selector: Value, doc: Value) -> bool {
        matches(&normalize(&selector).unwrap(), &doc)
    }

    #[test]
    fn test_eq_and_implicit_and() {
        let doc = json!({"name": "mike", "age": 34});
        assert!(check(json!({"name": "mike"}), doc.clone()));
        assert!(check(json!({"name": "mike", "age": {"$gt": 30}}), doc.clone()));
        assert!(!check(json!({"name": "mike", "age": {"$gt": 40}}), doc));
    }

    #[test]
    fn test_or() {
        let doc = json!({"name": "mike"});
        assert!(check(
            json!({"$or": [{"name": "fred"}, {"name": "mike"}]}),
            doc.clone()
        ));
        assert!(!check(json!({"$or": [{"name": "fred"}, {"name": "joe"}]}), doc));
    }

    #[test]
    fn test_array_member_semantics() {
        let doc = json!({"pets": ["cat", "dog"]});
        assert!(check(json!({"pets": "cat"}), doc.clone()));
        assert!(!check(json!({"pets": "fish"}), doc.clone()));
        // $ne over arrays: no element may equal the operand
        assert!(!check(json!({"pets": {"$ne": "cat"}}), doc.clone()));
        assert!(check(json!({"pets": {"$ne": "fish"}}), doc));
    }

    #[test]
    fn test_size_applies_to_the_array_itself() {
        let doc = json!({"pets": ["cat", "dog"]});
        assert!(check(json!({"pets": {"$size": 2}}), doc.clone()));
        assert!(!check(json!({"pets": {"$size": 1}}), doc.clone()));
        assert!(!check(json!({"name": {"$size": 1}}), doc));
    }

    #[test]
    fn test_exists() {
        let doc = json!({"name": "mike"});
        assert!(check(json!({"name": {"$exists": true}}), doc.clone()));
        assert!(check(json!({"age": {"$exists": false}}), doc.clone()));
        assert!(!check(json!({"age": {"$exists": true}}), doc));
    }

    #[test]
    fn test_in_and_nin() {
        let doc = json!({"age": 34});
        assert!(check(json!({"age": {"$in": [12, 34]}}), doc.clone()));
        assert!(!check(json!({"age": {"$nin": [12, 34]}}), doc.clone()));
        assert!(check(json!({"age": {"$nin": [1, 2]}}), doc));
    }

    #[test]
    fn test_mod() {
        let doc = json!({"age": 34});
        assert!(check(json!({"age": {"$mod": [10, 4]}}), doc.clone()));
        assert!(!check(json!({"age": {"$mod": [10, 5]}}), doc));
    }

    #[test]
    fn test_type() {
        let doc = json!({"age": 34, "name": "mike", "pets": []});
        assert!(check(json!({"age": {"$type": "number"}}), doc.clone()));
        assert!(check(json!({"pets": {"$type": "array"}}), doc.clone()));
        assert!(!check(json!({"name": {"$type": "number"}}), doc));
    }

    #[test]
    fn test_regex() {
        let doc = json!({"name": "mike"});
        assert!(check(json!({"name": {"$regex": "^mi"}}), doc.clone()));
        assert!(!check(json!({"name": {"$regex": "^zz"}}), doc));
    }

    #[test]
    fn test_nested_paths() {
        let doc = json!({"pet": {"species": {"name": "cat"}}});
        assert!(check(json!({"pet.species.name": "cat"}), doc.clone()));
        assert!(!check(json!({"pet.species.name": "dog"}), doc));
    }

    #[test]
    fn test_comparisons_across_types_never_match() {
        let doc = json!({"age": 34});
        assert!(!check(json!({"age": {"$gt": "x"}}), doc.clone()));
        assert!(!check(json!({"age": {"$lt": "x"}}), doc));
    }
}
