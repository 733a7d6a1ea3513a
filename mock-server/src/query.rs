//! Ad-hoc query evaluation for `POST /v1/query`.
//!
//! A query is a conjunction of `lhs = rhs` (or `:=`) expressions separated by
//! newlines or `;`. A bare identifier on the left binds a variable; anything
//! else is compared for equality. Terms are `data.<path>`, `input.<path>`,
//! bound variables or JSON literals. The result is a single row of bindings
//! when every expression holds, and no rows otherwise.

use serde_json::{Map, Value};

use crate::lookup;
use crate::module::is_identifier;

pub fn evaluate(query: &str, data: &Value, input: &Value) -> Result<Vec<Map<String, Value>>, String> {
    let expressions: Vec<&str> = query
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();
    if expressions.is_empty() {
        return Err("empty query".to_string());
    }

    let mut bindings = Map::new();
    for expression in expressions {
        let (lhs, rhs) = expression
            .split_once(":=")
            .or_else(|| expression.split_once('='))
            .map(|(l, r)| (l.trim(), r.trim()))
            .filter(|(l, r)| !l.is_empty() && !r.is_empty())
            .ok_or_else(|| format!("unexpected expression `{expression}`"))?;

        let Some(right) = resolve(rhs, data, input, &bindings)? else {
            return Ok(Vec::new());
        };

        if is_variable(lhs) && !bindings.contains_key(lhs) {
            bindings.insert(lhs.to_string(), right);
            continue;
        }
        match resolve(lhs, data, input, &bindings)? {
            Some(left) if left == right => {}
            _ => return Ok(Vec::new()),
        }
    }
    Ok(vec![bindings])
}

fn is_variable(term: &str) -> bool {
    is_identifier(term) && !matches!(term, "data" | "input" | "true" | "false" | "null")
}

/// `Ok(None)` when a reference is undefined.
fn resolve(
    term: &str,
    data: &Value,
    input: &Value,
    bindings: &Map<String, Value>,
) -> Result<Option<Value>, String> {
    if let Some(path) = reference(term, "data") {
        return Ok(lookup(data, &path).cloned());
    }
    if let Some(path) = reference(term, "input") {
        return Ok(lookup(input, &path).cloned());
    }
    if let Some(value) = bindings.get(term) {
        return Ok(Some(value.clone()));
    }
    if is_variable(term) {
        return Err(format!("var {term} is unsafe"));
    }
    serde_json::from_str(term)
        .map(Some)
        .map_err(|e| format!("invalid term `{term}`: {e}"))
}

fn reference(term: &str, root: &str) -> Option<Vec<String>> {
    if term == root {
        return Some(Vec::new());
    }
    let rest = term.strip_prefix(root)?.strip_prefix('.')?;
    Some(rest.split('.').map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binds_variables_from_data_and_input() {
        let data = json!({"servers": {"prod": ["a", "b"]}});
        let input = json!({"user": "alice"});
        let rows = evaluate("s = data.servers.prod\nu := input.user", &data, &input).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["s"], json!(["a", "b"]));
        assert_eq!(rows[0]["u"], "alice");
    }

    #[test]
    fn failed_comparison_yields_no_rows() {
        let input = json!({"protocol": "ftp"});
        let rows = evaluate(r#"input.protocol = "http""#, &json!({}), &input).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn undefined_reference_yields_no_rows() {
        let rows = evaluate("x = data.nothing.here", &json!({}), &json!({})).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn bound_variable_is_compared() {
        let rows = evaluate("x = 1; x = 2", &json!({}), &json!({})).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn malformed_queries_are_errors() {
        assert!(evaluate("", &json!({}), &json!({})).is_err());
        assert!(evaluate("not a query", &json!({}), &json!({})).is_err());
        assert!(evaluate("x = y", &json!({}), &json!({})).is_err());
    }
}
