//! `.env` files as read and written next to every install's compose file.

use std::{collections::BTreeMap, path::Path};

use anyhow::Context as _;
use serde_json::{Map, Value};

pub type EnvMap = BTreeMap<String, String>;

pub fn parse(input: &str) -> EnvMap {
    let mut out = EnvMap::new();
    for raw in input.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()));
    }
    out
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }
    // Unquoted values may carry a trailing comment.
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Serializes keys in sorted order. Integers are written bare, everything else double-quoted.
pub fn render(env: &EnvMap) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        if !value.is_empty() && value.parse::<i64>().is_ok() {
            out.push_str(value);
        } else {
            out.push('"');
            for c in value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        out.push('\n');
    }
    out
}

pub async fn read(path: &Path) -> anyhow::Result<EnvMap> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read env file {}", path.display()))?;
    Ok(parse(&content))
}

pub async fn write(path: &Path, env: &EnvMap) -> anyhow::Result<()> {
    tokio::fs::write(path, render(env))
        .await
        .with_context(|| format!("write env file {}", path.display()))
}

/// Flattens request params into env values.
///
/// Strings pass through, numbers lose a trailing `.0`, arrays become a lowercase comma list and
/// nested objects are lifted into the parent map.
pub fn flatten_params(params: &Map<String, Value>, out: &mut EnvMap) {
    for (key, value) in params {
        match value {
            Value::String(s) => {
                out.insert(key.clone(), s.clone());
            }
            Value::Number(n) => {
                out.insert(key.clone(), format_number(n));
            }
            Value::Bool(b) => {
                out.insert(key.clone(), b.to_string());
            }
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.to_lowercase(),
                        Value::Number(n) => format_number(n),
                        other => other.to_string().to_lowercase(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                out.insert(key.clone(), joined);
            }
            Value::Object(nested) => flatten_params(nested, out),
            Value::Null => {}
        }
    }
}

pub fn format_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

pub fn to_json(env: &EnvMap) -> anyhow::Result<String> {
    Ok(serde_json::to_string(env)?)
}

pub fn from_json(input: &str) -> anyhow::Result<EnvMap> {
    if input.trim().is_empty() {
        return Ok(EnvMap::new());
    }
    let value: Map<String, Value> = serde_json::from_str(input).context("parse env json")?;
    let mut out = EnvMap::new();
    flatten_params(&value, &mut out);
    Ok(out)
}
