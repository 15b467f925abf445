//! C2 — Tool-call extractor.
//!
//! Normalizes alternative invocation dialects into the canonical
//! `<tool_use>{json}</tool_use>` envelope, then scans for complete blocks,
//! salvaging malformed JSON via `json_repair` and falling back to treating
//! anything unparseable as plain text (spec.md §4.2). Never panics.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::json_repair;
use crate::message::ParsedToolCall;

pub const TOOL_USE_OPEN: &str = "<tool_use>";
pub const TOOL_USE_CLOSE: &str = "</tool_use>";

/// Result of a single extraction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractResult {
    pub text_parts: Vec<String>,
    pub tool_calls: Vec<ParsedToolCall>,
}

/// Parse `output` for tool-use blocks. Never raises; any internal failure
/// folds into "whatever was collected so far" plus the untouched remainder.
pub fn parse(output: &str) -> ExtractResult {
    let normalized = normalize(output);
    scan(&normalized)
}

/// Normalize alternative XML dialects into canonical `<tool_use>` blocks.
/// Input is left unchanged if no known dialect matches.
pub fn normalize(input: &str) -> String {
    let after_a = normalize_dialect_a(input);
    normalize_dialect_b(&after_a)
}

// ═══════════════════════════════════════════════════════════════
// DIALECT NORMALIZATION
// ═══════════════════════════════════════════════════════════════

/// Dialect A: `<function_calls><invoke><parameter name="name">X</parameter>
/// <parameter name="input">Y</parameter></invoke></function_calls>` — `Y` is
/// taken verbatim as the JSON input.
fn normalize_dialect_a(input: &str) -> String {
    let invoke_re = match Regex::new(r"(?s)<invoke>\s*(.*?)\s*</invoke>") {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };
    let param_re = match Regex::new(
        r#"(?s)<parameter\s+name="([^"]+)">\s*(.*?)\s*</parameter>"#,
    ) {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };
    let wrapper_re = match Regex::new(r"(?s)<function_calls>\s*(.*?)\s*</function_calls>") {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };

    let mut out = input.to_string();
    let wrappers: Vec<(usize, usize, String)> = wrapper_re
        .captures_iter(input)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let inner = cap.get(1)?.as_str().to_string();
            // Only dialect A if the wrapper body contains a "name"/"input" pair.
            let has_name_input = param_re
                .captures_iter(&inner)
                .any(|c| c.get(1).map(|m| m.as_str()) == Some("name"));
            if !has_name_input {
                return None;
            }
            Some((whole.start(), whole.end(), inner))
        })
        .collect();

    if wrappers.is_empty() {
        return out;
    }

    let mut replacement_spans: Vec<(usize, usize, String)> = Vec::new();
    for (start, end, inner) in &wrappers {
        let mut blocks = String::new();
        for invoke_cap in invoke_re.captures_iter(inner) {
            let Some(body) = invoke_cap.get(1) else { continue };
            let mut name = None;
            let mut input_json = None;
            for param_cap in param_re.captures_iter(body.as_str()) {
                let key = param_cap.get(1).map(|m| m.as_str()).unwrap_or("");
                let val = param_cap.get(2).map(|m| m.as_str()).unwrap_or("");
                match key {
                    "name" => name = Some(val.to_string()),
                    "input" => input_json = Some(val.to_string()),
                    _ => {}
                }
            }
            if let Some(name) = name {
                let input_json = input_json.unwrap_or_else(|| "{}".to_string());
                blocks.push_str(TOOL_USE_OPEN);
                blocks.push('\n');
                blocks.push_str(&format!(r#"{{"name": {}, "input": {}}}"#, quote_json_string(&name), input_json));
                blocks.push('\n');
                blocks.push_str(TOOL_USE_CLOSE);
            }
        }
        if !blocks.is_empty() {
            replacement_spans.push((*start, *end, blocks));
        }
    }

    // Apply replacements back-to-front so earlier byte offsets stay valid.
    for (start, end, blocks) in replacement_spans.into_iter().rev() {
        out.replace_range(start..end, &blocks);
    }
    out
}

/// Dialect B: `<function_calls><invoke name="X"><parameter name="k">v</parameter>
/// ...</invoke>...</function_calls>` — one `<invoke>` emits one `<tool_use>`
/// block; every `<parameter>` becomes a key/value in the input object.
fn normalize_dialect_b(input: &str) -> String {
    let wrapper_re = match Regex::new(r"(?s)<function_calls>\s*(.*?)\s*</function_calls>") {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };
    let invoke_re = match Regex::new(r#"(?s)<invoke\s+name="([^"]+)">\s*(.*?)\s*</invoke>"#) {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };
    let param_re = match Regex::new(
        r#"(?s)<parameter\s+name="([^"]+)">\s*(.*?)\s*</parameter>"#,
    ) {
        Ok(r) => r,
        Err(_) => return input.to_string(),
    };

    let mut out = input.to_string();
    let mut replacement_spans: Vec<(usize, usize, String)> = Vec::new();

    for wrapper_cap in wrapper_re.captures_iter(input) {
        let Some(whole) = wrapper_cap.get(0) else { continue };
        let inner = wrapper_cap.get(1).map(|m| m.as_str()).unwrap_or("");

        let mut blocks = String::new();
        let mut any = false;
        for invoke_cap in invoke_re.captures_iter(inner) {
            let name = invoke_cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let body = invoke_cap.get(2).map(|m| m.as_str()).unwrap_or("");
            let mut obj = serde_json::Map::new();
            for param_cap in param_re.captures_iter(body) {
                let key = param_cap.get(1).map(|m| m.as_str()).unwrap_or("");
                let val = param_cap.get(2).map(|m| m.as_str()).unwrap_or("");
                obj.insert(key.to_string(), Value::String(val.to_string()));
            }
            any = true;
            let input_json = serde_json::to_string(&Value::Object(obj)).unwrap_or_else(|_| "{}".to_string());
            blocks.push_str(TOOL_USE_OPEN);
            blocks.push('\n');
            blocks.push_str(&format!(r#"{{"name": {}, "input": {}}}"#, quote_json_string(name), input_json));
            blocks.push('\n');
            blocks.push_str(TOOL_USE_CLOSE);
            blocks.push('\n');
        }
        if any {
            replacement_spans.push((whole.start(), whole.end(), blocks));
        }
    }

    for (start, end, blocks) in replacement_spans.into_iter().rev() {
        out.replace_range(start..end, &blocks);
    }
    out
}

fn quote_json_string(s: &str) -> String {
    serde_json::to_string(&Value::String(s.to_string())).unwrap_or_else(|_| "\"\"".to_string())
}

// ═══════════════════════════════════════════════════════════════
// SCANNING
// ═══════════════════════════════════════════════════════════════

fn scan(normalized: &str) -> ExtractResult {
    let mut result = ExtractResult::default();
    let mut last_emitted_end = 0usize;
    let mut search_from = 0usize;

    loop {
        let Some(open_rel) = normalized[search_from..].find(TOOL_USE_OPEN) else {
            // No more tool_use blocks; remaining content is text.
            push_text(&mut result, &normalized[last_emitted_end..]);
            break;
        };
        let open_idx = search_from + open_rel;

        push_text(&mut result, &normalized[last_emitted_end..open_idx]);

        let content_start = open_idx + TOOL_USE_OPEN.len();
        match normalized[content_start..].find(TOOL_USE_CLOSE) {
            Some(close_rel) => {
                let close_idx = content_start + close_rel;
                let inner = &normalized[content_start..close_idx];
                let block_end = close_idx + TOOL_USE_CLOSE.len();

                match parse_block(inner) {
                    Some(call) => result.tool_calls.push(call),
                    None => push_text(&mut result, &normalized[open_idx..block_end]),
                }

                last_emitted_end = block_end;
                search_from = block_end;
            }
            None => {
                // Truncated at end of stream: attempt to parse the remainder.
                let inner = &normalized[content_start..];
                match parse_block(inner) {
                    Some(call) => {
                        result.tool_calls.push(call);
                        last_emitted_end = normalized.len();
                    }
                    None => {
                        push_text(&mut result, &normalized[open_idx..]);
                        last_emitted_end = normalized.len();
                    }
                }
                break;
            }
        }
    }

    result
}

fn push_text(result: &mut ExtractResult, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        result.text_parts.push(trimmed.to_string());
    }
}

/// Parse the inner JSON of a `<tool_use>` block into a `ParsedToolCall`.
/// Returns `None` if the JSON cannot be salvaged, or parses to an object
/// with an empty/missing `name`.
fn parse_block(inner: &str) -> Option<ParsedToolCall> {
    let trimmed = inner.trim();
    let repaired = if serde_json::from_str::<Value>(trimmed).is_ok() {
        trimmed.to_string()
    } else {
        json_repair::repair(trimmed)?
    };

    let value: Value = serde_json::from_str(&repaired).ok()?;
    value_to_tool_call(&value)
}

fn value_to_tool_call(value: &Value) -> Option<ParsedToolCall> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(|v| v.as_str())?;
    if name.is_empty() {
        return None;
    }

    let arguments = extract_arguments(obj);
    let input = stringify_map(&arguments);
    // `serde_json`'s `preserve_order` feature keeps `arguments`'s keys in
    // the order the model emitted them, so this re-serialization preserves
    // both key order and value types rather than reconstructing from the
    // stringified `input` map.
    let arguments_json = serde_json::to_string(&Value::Object(arguments)).unwrap_or_else(|_| "{}".to_string());
    Some(ParsedToolCall {
        name: name.to_string(),
        input,
        arguments_json,
    })
}

/// Extract the arguments object via three fallbacks, in order: (a) nested
/// `input` object, (b) all top-level keys except `name`/`input`, (c) empty.
fn extract_arguments(obj: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    if let Some(Value::Object(input_obj)) = obj.get("input") {
        return input_obj.clone();
    }

    let mut map = serde_json::Map::new();
    for (k, v) in obj {
        if k == "name" || k == "input" {
            continue;
        }
        map.insert(k.clone(), v.clone());
    }
    map
}

fn stringify_map(obj: &serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    obj.iter().map(|(k, v)| (k.clone(), stringify_value(v))).collect()
}

/// Strings pass through verbatim; everything else is JSON-serialized
/// losslessly for the executor's untyped string-map interface.
fn stringify_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
