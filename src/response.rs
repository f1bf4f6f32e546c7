//! Lenient parsing of model answers.
//!
//! Models wrap JSON in Markdown fences, add chatter around it, or stop at
//! `max_tokens` halfway through an array. [`parse_conflicts`] recovers what it
//! can, in this order:
//!
//! 1. Strip a ```` ```json ```` or bare ```` ``` ```` fence.
//! 2. Parse the whole text as a JSON array (or an object holding one).
//! 3. Salvage: scan brace depth from the first `[` and parse every balanced
//!    top-level `{...}` on its own, keeping the ones that decode.
//! 4. Last resort: the span from the first `{` to the last `}`.
//!
//! Items missing `req_a`, `req_b`, `reason` or `confidence` are dropped
//! individually. Only text with no recoverable JSON at all is an error.

use anyhow::Result;
use serde_json::Value;

use crate::error::KbError;

const REQUIRED_FIELDS: [&str; 4] = ["req_a", "req_b", "reason", "confidence"];

/// One conflict as the model reported it, before ids are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConflict {
    pub req_a: String,
    pub req_b: String,
    pub reason: String,
    pub confidence: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub items: Vec<RawConflict>,
    /// Decoded objects rejected for missing fields.
    pub dropped: usize,
    /// True when the top-level parse failed and objects were rescued.
    pub salvaged: bool,
}

/// Remove a surrounding Markdown code fence. An unterminated fence (a
/// truncated answer) keeps everything after the opening line.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let body = if let Some(pos) = text.find("```json") {
        &text[pos + "```json".len()..]
    } else if let Some(pos) = text.find("```") {
        let rest = &text[pos + 3..];
        // Skip a language tag on the fence line.
        match rest.find('\n') {
            Some(nl) if !rest[..nl].trim().contains(['[', '{']) => &rest[nl + 1..],
            _ => rest,
        }
    } else {
        return text;
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

pub fn parse_conflicts(text: &str) -> Result<ParseOutcome> {
    let body = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(items) = top_level_items(value) {
            return Ok(collect(items, false));
        }
    }

    let rescued = salvage_objects(body);
    if !rescued.is_empty() {
        return Ok(collect(rescued, true));
    }

    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&body[start..=end]) {
                if let Some(items) = top_level_items(value) {
                    return Ok(collect(items, true));
                }
            }
        }
    }

    let preview: String = body.chars().take(200).collect();
    Err(KbError::MalformedResponse(format!("no JSON conflicts found in: {}", preview)).into())
}

fn top_level_items(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("conflicts") {
            Some(Value::Array(items)) => Some(items),
            Some(_) => None,
            None => Some(vec![Value::Object(map)]),
        },
        _ => None,
    }
}

fn collect(items: Vec<Value>, salvaged: bool) -> ParseOutcome {
    let mut outcome = ParseOutcome {
        salvaged,
        ..ParseOutcome::default()
    };
    for item in items {
        match to_raw(&item) {
            Some(raw) => outcome.items.push(raw),
            None => outcome.dropped += 1,
        }
    }
    outcome
}

fn to_raw(item: &Value) -> Option<RawConflict> {
    let obj = item.as_object()?;
    if !REQUIRED_FIELDS.iter().all(|f| obj.contains_key(*f)) {
        return None;
    }
    Some(RawConflict {
        req_a: scalar_string(&obj["req_a"])?,
        req_b: scalar_string(&obj["req_b"])?,
        reason: scalar_string(&obj["reason"])?,
        confidence: scalar_string(&obj["confidence"])?,
    })
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse each balanced top-level object inside the first array on its own.
/// String literals are skipped so braces inside reasons do not count.
fn salvage_objects(text: &str) -> Vec<Value> {
    let start = text.find('[').map_or(0, |i| i + 1);
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut obj_start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        let i = start + offset;
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    obj_start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = obj_start.take() {
                        if let Ok(v) = serde_json::from_str::<Value>(&text[s..=i]) {
                            out.push(v);
                        }
                    }
                }
            }
            b']' if depth == 0 => break,
            _ => {}
        }
    }
    out
}

/// Comma-separated tag list, filtered to `allowed` (case-insensitive, canonical
/// spelling kept), at most three, first occurrence wins.
pub fn parse_tags(text: &str, allowed: &[&str]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for raw in text.split([',', '\n']) {
        let candidate = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '*' || c == '-')
            .trim();
        if let Some(tag) = allowed.iter().find(|a| a.eq_ignore_ascii_case(candidate)) {
            if !tags.iter().any(|t| t == tag) {
                tags.push((*tag).to_string());
            }
        }
        if tags.len() == 3 {
            break;
        }
    }
    tags
}
