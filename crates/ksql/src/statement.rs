//! Statement text with bound parameters
//!
//! Supports ordinal (`$1`, `$2`, ...) and named (`:name`) placeholders.
//! Placeholders inside single-quoted literals are left untouched, as are
//! placeholders with no matching parameter.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{KsqlError, Result};

#[derive(Debug, Clone, Default)]
pub struct Params {
    ordinal: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for the next `$n` placeholder.
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.ordinal.push(value.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    fn ordinal(&self, n: usize) -> Option<&Value> {
        n.checked_sub(1).and_then(|i| self.ordinal.get(i))
    }
}

/// Render `sql` with `params` substituted.
///
/// Statements must end with `;` (trailing whitespace allowed).
pub fn build_statement(sql: &str, params: &Params) -> Result<String> {
    if !sql.trim_end().ends_with(';') {
        return Err(KsqlError::MissingSemicolon);
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\'' {
            in_literal = !in_literal;
            out.push(ch);
            i += 1;
            continue;
        }
        if in_literal || (ch != '$' && ch != ':') {
            out.push(ch);
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        if ch == '$' {
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
        } else {
            while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
        }
        let token: String = chars[start..end].iter().collect();

        let value = match ch {
            '$' => token.parse::<usize>().ok().and_then(|n| params.ordinal(n)),
            _ => params.named.get(&token),
        };
        match value {
            Some(value) if !token.is_empty() => out.push_str(&render(value)),
            _ => {
                out.push(ch);
                out.push_str(&token);
            }
        }
        i = end;
    }

    Ok(out)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}
