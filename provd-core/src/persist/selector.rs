//! Selector evaluation.
//!
//! A selector maps dotted keys to either a scalar (equality match) or an
//! operator object (`$in`, `$nin`, `$contains`, `$gt`, `$ge`, `$lt`,
//! `$le`, `$ne`, `$exists`). Dotted keys traverse nested objects and
//! flatten through arrays: an array of objects matches if any element
//! matches.

use std::cmp::Ordering;

use serde_json::Value;

use super::{Document, Selector};

/// Collect every value in `doc` reachable through the dotted select key.
pub fn retrieve_doc_values<'a>(s_key: &str, doc: &'a Value) -> Vec<&'a Value> {
    let mut results = Vec::new();
    collect(s_key, doc, &mut results);
    results
}

fn collect<'a>(s_key: &str, current: &'a Value, results: &mut Vec<&'a Value>) {
    match s_key.split_once('.') {
        None => match current {
            Value::Object(map) => {
                if let Some(value) = map.get(s_key) {
                    results.push(value);
                }
            }
            Value::Array(items) => {
                for item in items {
                    collect(s_key, item, results);
                }
            }
            _ => {}
        },
        Some((pre, post)) => {
            if let Value::Object(map) = current {
                if let Some(value) = map.get(pre) {
                    collect(post, value, results);
                }
            }
        }
    }
}

/// True if the selector value carries operator semantics.
pub fn contains_operator(selector_value: &Value) -> bool {
    match selector_value {
        Value::Object(map) => map.keys().any(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64()?;
            let y = y.as_f64()?;
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches_operator(op: &str, op_value: &Value, s_key: &str, doc: &Value) -> bool {
    let doc_values = retrieve_doc_values(s_key, doc);
    match op {
        "$in" => match op_value {
            Value::Array(candidates) => doc_values.iter().any(|v| candidates.contains(v)),
            _ => false,
        },
        "$nin" => match op_value {
            Value::Array(candidates) => !doc_values.iter().any(|v| candidates.contains(v)),
            _ => false,
        },
        "$contains" => doc_values.iter().any(|v| match (v, op_value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        }),
        "$gt" => doc_values
            .iter()
            .any(|v| compare_values(v, op_value) == Some(Ordering::Greater)),
        "$ge" => doc_values.iter().any(|v| {
            matches!(
                compare_values(v, op_value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            )
        }),
        "$lt" => doc_values
            .iter()
            .any(|v| compare_values(v, op_value) == Some(Ordering::Less)),
        "$le" => doc_values.iter().any(|v| {
            matches!(
                compare_values(v, op_value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            )
        }),
        "$ne" => !doc_values.iter().any(|v| *v == op_value),
        "$exists" => {
            let wanted = is_truthy(op_value);
            doc_values.is_empty() != wanted
        }
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn matches_key(s_key: &str, s_value: &Value, doc: &Value) -> bool {
    if contains_operator(s_value) {
        let Value::Object(ops) = s_value else {
            return false;
        };
        // multiple operators on the same key AND together
        ops.iter()
            .all(|(op, op_value)| matches_operator(op, op_value, s_key, doc))
    } else {
        retrieve_doc_values(s_key, doc).iter().any(|v| *v == s_value)
    }
}

/// True if the document matches every key of the selector.
pub fn matches(selector: &Selector, doc: &Document) -> bool {
    let doc_value = Value::Object(doc.clone());
    selector
        .iter()
        .all(|(s_key, s_value)| matches_key(s_key, s_value, &doc_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn sel(value: serde_json::Value) -> Selector {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_equality_match() {
        let d = doc(json!({"id": "a", "ip": "10.0.0.1"}));
        assert!(matches(&sel(json!({"ip": "10.0.0.1"})), &d));
        assert!(!matches(&sel(json!({"ip": "10.0.0.2"})), &d));
        assert!(matches(&sel(json!({})), &d));
    }

    #[test]
    fn test_dotted_key() {
        let d = doc(json!({"id": "a", "raw_config": {"sip_lines": {"1": {"username": "u"}}}}));
        assert!(matches(
            &sel(json!({"raw_config.sip_lines.1.username": "u"})),
            &d
        ));
        assert!(!matches(
            &sel(json!({"raw_config.sip_lines.2.username": "u"})),
            &d
        ));
    }

    #[test]
    fn test_dotted_key_through_list() {
        let d = doc(json!({"id": "a", "lines": [{"no": 1}, {"no": 2}]}));
        assert!(matches(&sel(json!({"lines.no": 2})), &d));
        assert!(!matches(&sel(json!({"lines.no": 3})), &d));
    }

    #[test]
    fn test_in_nin() {
        let d = doc(json!({"id": "a", "plugin": "acme"}));
        assert!(matches(&sel(json!({"plugin": {"$in": ["acme", "b"]}})), &d));
        assert!(!matches(&sel(json!({"plugin": {"$in": ["b"]}})), &d));
        assert!(matches(&sel(json!({"plugin": {"$nin": ["b"]}})), &d));
        assert!(!matches(&sel(json!({"plugin": {"$nin": ["acme"]}})), &d));
    }

    #[test]
    fn test_contains() {
        let d = doc(json!({"id": "a", "model": "T46G", "tags": ["x", "y"]}));
        assert!(matches(&sel(json!({"model": {"$contains": "46"}})), &d));
        assert!(!matches(&sel(json!({"model": {"$contains": "47"}})), &d));
        assert!(matches(&sel(json!({"tags": {"$contains": "x"}})), &d));
        assert!(!matches(&sel(json!({"tags": {"$contains": "z"}})), &d));
    }

    #[test]
    fn test_ordering_operators() {
        let d = doc(json!({"id": "a", "version": 3}));
        assert!(matches(&sel(json!({"version": {"$gt": 2}})), &d));
        assert!(matches(&sel(json!({"version": {"$ge": 3}})), &d));
        assert!(matches(&sel(json!({"version": {"$lt": 4}})), &d));
        assert!(matches(&sel(json!({"version": {"$le": 3}})), &d));
        assert!(!matches(&sel(json!({"version": {"$gt": 3}})), &d));
    }

    #[test]
    fn test_ne() {
        let d = doc(json!({"id": "a", "ip": "10.0.0.1"}));
        assert!(matches(&sel(json!({"ip": {"$ne": "10.0.0.2"}})), &d));
        assert!(!matches(&sel(json!({"ip": {"$ne": "10.0.0.1"}})), &d));
        // missing key never equals, so $ne matches
        assert!(matches(&sel(json!({"mac": {"$ne": "x"}})), &d));
    }

    #[test]
    fn test_exists() {
        let d = doc(json!({"id": "a", "ip": "10.0.0.1"}));
        assert!(matches(&sel(json!({"ip": {"$exists": true}})), &d));
        assert!(!matches(&sel(json!({"ip": {"$exists": false}})), &d));
        assert!(matches(&sel(json!({"mac": {"$exists": false}})), &d));
        assert!(!matches(&sel(json!({"mac": {"$exists": true}})), &d));
    }

    #[test]
    fn test_multiple_operators_and_together() {
        let d = doc(json!({"id": "a", "version": 3}));
        assert!(matches(&sel(json!({"version": {"$gt": 2, "$lt": 4}})), &d));
        assert!(!matches(&sel(json!({"version": {"$gt": 2, "$lt": 3}})), &d));
    }

    #[test]
    fn test_contains_operator_detection() {
        assert!(contains_operator(&json!({"$in": ["a"]})));
        assert!(!contains_operator(&json!({"in": ["a"]})));
        assert!(!contains_operator(&json!("a")));
    }
}
