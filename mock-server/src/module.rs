//! The policy dialect understood by the mock server.
//!
//! A module is a `package a.b` line followed by constant rules:
//!
//! ```text
//! package authz
//!
//! default allow := false
//! admins := ["alice"]
//! ```
//!
//! Rule values are JSON literals. Blank lines and `#` comments are ignored.
//! That is enough for the client's tests to store, list, evaluate and
//! conflict policies without a real evaluator.

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub value: Value,
    pub default: bool,
    pub row: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub package: Vec<String>,
    pub rules: Vec<Rule>,
}

/// A compile failure, reported back in the server's error body shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub code: &'static str,
    pub message: String,
    pub row: usize,
}

impl CompileError {
    fn parse(row: usize, message: impl Into<String>) -> Self {
        Self {
            code: "rego_parse_error",
            message: message.into(),
            row,
        }
    }
}

impl Module {
    pub fn parse(source: &str) -> Result<Self, CompileError> {
        let mut lines = source
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (row, header) = lines
            .next()
            .ok_or_else(|| CompileError::parse(1, "empty module"))?;
        let package = header
            .strip_prefix("package ")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CompileError::parse(row, "package expected"))?;
        let package: Vec<String> = package.split('.').map(str::to_string).collect();
        if !package.iter().all(|segment| is_identifier(segment)) {
            return Err(CompileError::parse(row, "invalid package name"));
        }

        let mut rules = Vec::new();
        for (row, line) in lines {
            let (default, rest) = match line.strip_prefix("default ") {
                Some(rest) => (true, rest.trim_start()),
                None => (false, line),
            };
            let (name, value) = split_assignment(rest)
                .ok_or_else(|| CompileError::parse(row, format!("unexpected statement `{line}`")))?;
            if !is_identifier(name) {
                return Err(CompileError::parse(row, format!("invalid rule name `{name}`")));
            }
            let value: Value = serde_json::from_str(value)
                .map_err(|e| CompileError::parse(row, format!("invalid rule value: {e}")))?;
            rules.push(Rule {
                name: name.to_string(),
                value,
                default,
                row,
            });
        }

        let module = Self { package, rules };
        if let Some(rule) = module.duplicate_default(&[]) {
            return Err(multiple_defaults(rule));
        }
        Ok(module)
    }

    /// First default rule that clashes with a default of the same name in
    /// this module or in any of `others` sharing the package.
    pub fn duplicate_default<'a>(&'a self, others: &[&Module]) -> Option<&'a Rule> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.default)
            .find(|(i, rule)| {
                let in_self = self.rules[..*i]
                    .iter()
                    .any(|r| r.default && r.name == rule.name);
                let in_others = others.iter().any(|other| {
                    other.package == self.package
                        && other.rules.iter().any(|r| r.default && r.name == rule.name)
                });
                in_self || in_others
            })
            .map(|(_, rule)| rule)
    }

    /// Minimal AST, shaped loosely after the real server's output.
    pub fn ast(&self) -> Value {
        let path: Vec<Value> = std::iter::once(json!({"type": "var", "value": "data"}))
            .chain(
                self.package
                    .iter()
                    .map(|segment| json!({"type": "string", "value": segment})),
            )
            .collect();
        let rules: Vec<Value> = self
            .rules
            .iter()
            .map(|rule| {
                json!({
                    "default": rule.default,
                    "head": {"name": rule.name, "value": rule.value},
                })
            })
            .collect();
        json!({"package": {"path": path}, "rules": rules})
    }
}

pub fn multiple_defaults(rule: &Rule) -> CompileError {
    CompileError {
        code: "rego_type_error",
        message: format!("multiple default rules named {} found", rule.name),
        row: rule.row,
    }
}

fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let (name, value) = statement
        .split_once(":=")
        .or_else(|| statement.split_once('='))?;
    let value = value.trim();
    (!value.is_empty()).then_some((name.trim(), value))
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
