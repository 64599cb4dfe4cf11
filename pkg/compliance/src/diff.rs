use serde_json::Value;

use pkg_types::violation::FieldChange;

/// Escape one JSON-pointer reference token.
fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Field-level structural diff of two JSON documents. Paths are JSON
/// pointers; a missing side is `None`. Equal documents yield no changes.
pub fn diff_values(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    walk("", Some(before), Some(after), &mut changes);
    changes
}

fn walk(path: &str, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<FieldChange>) {
    match (before, after) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{}/{}", path, escape(key));
                walk(&child, a.get(key), b.get(key), out);
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for i in 0..a.len().max(b.len()) {
                let child = format!("{}/{}", path, i);
                walk(&child, a.get(i), b.get(i), out);
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(FieldChange {
            path: path.to_string(),
            before: a.cloned(),
            after: b.cloned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents_have_no_diff() {
        let doc = json!({"name": "reader", "rules": [{"verbs": ["get"]}]});
        assert!(diff_values(&doc, &doc).is_empty());
    }

    #[test]
    fn nested_changes_use_json_pointers() {
        let before = json!({"rules": [{"verbs": ["get"]}], "labels": {"a/b": "1"}});
        let after = json!({"rules": [{"verbs": ["get", "delete"]}], "labels": {"a/b": "2"}});
        let changes = diff_values(&before, &after);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "/labels/a~1b");
        assert_eq!(changes[0].before, Some(json!("1")));
        assert_eq!(changes[1].path, "/rules/0/verbs/1");
        assert_eq!(changes[1].before, None);
        assert_eq!(changes[1].after, Some(json!("delete")));
    }

    #[test]
    fn type_changes_are_leaf_changes() {
        let changes = diff_values(&json!({"x": [1]}), &json!({"x": {"y": 1}}));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "/x");
    }
}
