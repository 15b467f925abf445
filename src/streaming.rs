//! C3 — Streaming emitter.
//!
//! Consumes raw text tokens from the model one at a time and emits
//! `StreamEvent`s: text deltas with minimal latency, tool-call events as
//! soon as a complete `<tool_use>` block is recognised, and truncation at
//! hallucinated conversation-turn markers (spec.md §4.3).
//!
//! State is kept small by deriving the holdback bound from `accumulated`
//! itself rather than a separate buffer, per spec.md §9's redesign note.

use uuid::Uuid;

use crate::message::{FinishReason, StreamEvent};
use crate::tool_parser;

/// Longest canonical/alternative tag opener we must not split mid-emission,
/// plus slack.
const HOLDBACK_K: usize = 30;

const HUMAN_MARKERS: &[&str] = &["\n\nHuman:", "\n\nH:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StreamingText,
    EmittingTool,
    PostTool,
}

/// Drives the token-by-token scan and produces the event sequence. One
/// instance per model response.
pub struct StreamingEmitter {
    run_id: String,
    model: String,
    accumulated: String,
    current_message_id: Option<String>,
    emitted_clean_len: usize,
    inline_tool_emitted: bool,
    tool_scan_offset: usize,
    phase: Phase,
    truncated_at_hallucination: bool,
    events: Vec<StreamEvent>,
}

impl StreamingEmitter {
    pub fn new(run_id: impl Into<String>, model: impl Into<String>) -> Self {
        let mut emitter = StreamingEmitter {
            run_id: run_id.into(),
            model: model.into(),
            accumulated: String::new(),
            current_message_id: None,
            emitted_clean_len: 0,
            inline_tool_emitted: false,
            tool_scan_offset: 0,
            phase: Phase::StreamingText,
            truncated_at_hallucination: false,
            events: Vec::new(),
        };
        emitter.events.push(StreamEvent::RunStarted {
            run_id: emitter.run_id.clone(),
            model: emitter.model.clone(),
        });
        emitter
    }

    /// Feed one raw token. Returns `false` once the read loop should stop
    /// (hallucinated-turn truncation).
    pub fn push_token(&mut self, token: &str) -> bool {
        self.accumulated.push_str(token);

        if let Some(cut) = find_hallucinated_turn(&self.accumulated) {
            self.accumulated.truncate(cut);
            self.truncated_at_hallucination = true;
            self.flush_remaining_text();
            return false;
        }

        if !self.inline_tool_emitted {
            self.scan_for_tool_block();
        }

        true
    }

    /// Call once the token stream ends (normally, not via hallucination
    /// truncation, which already finalizes).
    pub fn finish_stream(&mut self) {
        if self.truncated_at_hallucination {
            self.finalize();
            return;
        }

        if !self.inline_tool_emitted {
            self.post_stream_fallback();
        } else {
            self.flush_remaining_text();
        }

        self.finalize();
    }

    /// Call on a transport-level stream error instead of `finish_stream`.
    pub fn finish_with_error(&mut self, message: impl Into<String>, code: Option<String>) {
        self.end_current_text_message();
        self.events.push(StreamEvent::RunError { message: message.into(), code });
    }

    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    // ── internals ──────────────────────────────────────────────────

    fn scan_for_tool_block(&mut self) {
        let normalized_so_far = tool_parser::normalize(&self.accumulated);
        let Some(open_rel) = normalized_so_far[self.tool_scan_offset..].find(tool_parser::TOOL_USE_OPEN) else {
            self.emit_safe_text(&normalized_so_far);
            return;
        };
        let open_idx = self.tool_scan_offset + open_rel;
        let Some(close_rel) = normalized_so_far[open_idx..].find(tool_parser::TOOL_USE_CLOSE) else {
            // Block not yet complete; emit text only up to its start.
            self.emit_clean_prefix(&normalized_so_far, open_idx);
            return;
        };
        let close_idx = open_idx + close_rel;
        let block_end = close_idx + tool_parser::TOOL_USE_CLOSE.len();

        // Text before the block.
        self.emit_clean_prefix(&normalized_so_far, open_idx);
        self.end_current_text_message();

        let inner = &normalized_so_far[open_idx + tool_parser::TOOL_USE_OPEN.len()..close_idx];
        if let Some(call) = tool_parser::parse(&format!("{}{}{}", tool_parser::TOOL_USE_OPEN, inner, tool_parser::TOOL_USE_CLOSE))
            .tool_calls
            .into_iter()
            .next()
        {
            self.emit_tool_call(&call.name, &call.arguments_json, call.input);
            self.inline_tool_emitted = true;
            self.phase = Phase::PostTool;
        }

        self.tool_scan_offset = block_end;
        self.emitted_clean_len = block_end;

        // Any text already present after the block in this token.
        self.start_new_text_message();
        self.emit_safe_text(&normalized_so_far);
    }

    /// Emit text up to the holdback-safe bound of the full clean
    /// projection, honoring `emitted_clean_len` as the low-water mark.
    fn emit_safe_text(&mut self, normalized_so_far: &str) {
        let safe_end = holdback_bound(normalized_so_far);
        self.emit_clean_prefix(normalized_so_far, safe_end);
    }

    fn emit_clean_prefix(&mut self, normalized_so_far: &str, end: usize) {
        if end <= self.emitted_clean_len {
            return;
        }
        let end = end.min(normalized_so_far.len());
        if end <= self.emitted_clean_len {
            return;
        }
        // Respect UTF-8 boundaries: never split a multibyte char.
        let end = floor_char_boundary(normalized_so_far, end);
        if end <= self.emitted_clean_len {
            return;
        }
        let delta = &normalized_so_far[self.emitted_clean_len..end];
        if delta.is_empty() {
            return;
        }
        self.ensure_text_message_started();
        self.events.push(StreamEvent::TextMessageContent {
            message_id: self.current_message_id.clone().unwrap_or_default(),
            delta: delta.to_string(),
        });
        self.emitted_clean_len = end;
    }

    fn ensure_text_message_started(&mut self) {
        if self.current_message_id.is_none() {
            self.start_new_text_message();
        }
    }

    fn start_new_text_message(&mut self) {
        let id = Uuid::new_v4().to_string();
        self.current_message_id = Some(id.clone());
        self.events.push(StreamEvent::TextMessageStart { message_id: id });
    }

    fn end_current_text_message(&mut self) {
        if let Some(id) = self.current_message_id.take() {
            self.events.push(StreamEvent::TextMessageEnd { message_id: id });
        }
    }

    /// `arguments_json` is the verbatim (order- and type-preserving)
    /// arguments object the model emitted (`ParsedToolCall::arguments_json`);
    /// `input` is the executor-facing stringified map. `ToolCallArgs.delta`
    /// carries `arguments_json`, not a re-serialization of `input`, so a
    /// caller that threads it into `ToolCallRecord` doesn't alphabetize keys
    /// or stringify numbers and booleans.
    fn emit_tool_call(&mut self, name: &str, arguments_json: &str, input: std::collections::BTreeMap<String, String>) {
        let call_id = Uuid::new_v4().to_string();
        let index = self.events.iter().filter(|e| matches!(e, StreamEvent::ToolCallStart { .. })).count();
        self.events.push(StreamEvent::ToolCallStart { call_id: call_id.clone(), name: name.to_string(), index });
        if !arguments_json.is_empty() {
            self.events.push(StreamEvent::ToolCallArgs { call_id: call_id.clone(), delta: arguments_json.to_string() });
        }
        self.events.push(StreamEvent::ToolCallEnd { call_id, name: name.to_string(), input });
    }

    /// Flush whatever text remains after the point we've already emitted
    /// through. Parses the remaining span instead of emitting it verbatim so
    /// any further `<tool_use>` block (beyond the one already-inline-emitted
    /// call) is stripped rather than leaked as raw XML to text consumers;
    /// its tool call is parsed and dropped with a warning, per the
    /// at-most-one-inline-tool-call rule.
    fn flush_remaining_text(&mut self) {
        let normalized = tool_parser::normalize(&self.accumulated);
        let end = floor_char_boundary(&normalized, normalized.len());
        if end > self.emitted_clean_len {
            let tail = &normalized[self.emitted_clean_len..end];
            let result = tool_parser::parse(tail);
            if !result.tool_calls.is_empty() {
                eprintln!(
                    "streaming: dropping {} tool_use block(s) found while flushing trailing text",
                    result.tool_calls.len()
                );
            }
            self.emitted_clean_len = end;
            for (i, text) in result.text_parts.iter().enumerate() {
                if i == 0 {
                    self.ensure_text_message_started();
                } else {
                    self.start_new_text_message();
                }
                self.events.push(StreamEvent::TextMessageContent {
                    message_id: self.current_message_id.clone().unwrap_or_default(),
                    delta: text.clone(),
                });
                self.end_current_text_message();
            }
        }
        self.end_current_text_message();
    }

    /// Run when the stream ended without an inline tool-call emission: parse
    /// the full normalized output and emit any tool call plus remaining text
    /// segments after `TextMessageEnd`.
    fn post_stream_fallback(&mut self) {
        let normalized = tool_parser::normalize(&self.accumulated);
        let result = tool_parser::parse(&normalized);

        // Emit whatever clean text was already pending (holdback included,
        // since the stream is over).
        let leading_text = result.text_parts.first().cloned();
        if let Some(text) = &leading_text {
            self.ensure_text_message_started();
            self.events.push(StreamEvent::TextMessageContent {
                message_id: self.current_message_id.clone().unwrap_or_default(),
                delta: text.clone(),
            });
        } else if self.current_message_id.is_none() && self.emitted_clean_len == 0 {
            // Nothing emitted at all yet and nothing to emit; still open/close
            // an empty text message so consumers see a consistent shape only
            // if there is truly no content anywhere.
        }
        self.end_current_text_message();

        if let Some(call) = result.tool_calls.first() {
            self.emit_tool_call(&call.name, &call.arguments_json, call.input.clone());
            self.inline_tool_emitted = true;
        }

        for extra_text in result.text_parts.iter().skip(1) {
            self.start_new_text_message();
            self.events.push(StreamEvent::TextMessageContent {
                message_id: self.current_message_id.clone().unwrap_or_default(),
                delta: extra_text.clone(),
            });
            self.end_current_text_message();
        }
    }

    fn finalize(&mut self) {
        let reason = if self.inline_tool_emitted { FinishReason::ToolCalls } else { FinishReason::Stop };
        self.events.push(StreamEvent::RunFinished { finish_reason: reason });
    }
}

/// First index at which `"\n\nHuman:"` or `"\n\nH:"` occurs, if any.
fn find_hallucinated_turn(accumulated: &str) -> Option<usize> {
    HUMAN_MARKERS.iter().filter_map(|m| accumulated.find(m)).min()
}

/// The index up to which it is safe to emit clean text: if the most recent
/// `<` is within `HOLDBACK_K` of the end, hold back everything from there.
fn holdback_bound(text: &str) -> usize {
    let len = text.len();
    if len <= HOLDBACK_K {
        return match text.rfind('<') {
            Some(idx) => idx,
            None => len,
        };
    }
    let window_start = len - HOLDBACK_K;
    match text[window_start..].find('<') {
        Some(rel) => window_start + rel,
        None => len,
    }
}

/// The largest `new_end <= end` that lies on a UTF-8 char boundary.
fn floor_char_boundary(s: &str, end: usize) -> usize {
    let mut end = end.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_tokens(tokens: &[&str]) -> Vec<StreamEvent> {
        let mut emitter = StreamingEmitter::new("run-1", "test-model");
        for t in tokens {
            if !emitter.push_token(t) {
                break;
            }
        }
        emitter.finish_stream();
        emitter.into_events()
    }

    fn text_deltas(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextMessageContent { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_tool_call_scenario() {
        let tokens: Vec<&str> = "Reading.\n<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\"}}\n</tool_use>\nDone."
            .split_inclusive(|_c: char| false)
            .collect();
        // Split into small chunks to exercise incremental scanning.
        let raw = "Reading.\n<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\"}}\n</tool_use>\nDone.";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let _ = tokens;
        let events = run_tokens(&chunks);

        assert!(text_deltas(&events).contains("Reading."));
        assert!(text_deltas(&events).contains("Done."));

        let tool_end = events.iter().find_map(|e| match e {
            StreamEvent::ToolCallEnd { name, input, .. } => Some((name.clone(), input.clone())),
            _ => None,
        });
        let (name, input) = tool_end.expect("tool call end present");
        assert_eq!(name, "file_read");
        assert_eq!(input.get("path"), Some(&"/a.txt".to_string()));

        assert!(matches!(events.last(), Some(StreamEvent::RunFinished { finish_reason: FinishReason::ToolCalls })));
    }

    #[test]
    fn tool_call_args_delta_preserves_key_order_and_value_types() {
        let raw = "<tool_use>\n{\"name\":\"glob\",\"input\":{\"path\":\"/a.txt\",\"recursive\":true,\"limit\":5}}\n</tool_use>";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let events = run_tokens(&chunks);

        let args = events.iter().find_map(|e| match e {
            StreamEvent::ToolCallArgs { delta, .. } => Some(delta.clone()),
            _ => None,
        });
        assert_eq!(args, Some(r#"{"path":"/a.txt","recursive":true,"limit":5}"#.to_string()));
    }

    #[test]
    fn truncated_tool_json_repaired_via_fallback() {
        let raw = "<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\"";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let events = run_tokens(&chunks);

        let tool_end = events.iter().find_map(|e| match e {
            StreamEvent::ToolCallEnd { name, input, .. } => Some((name.clone(), input.clone())),
            _ => None,
        });
        let (name, input) = tool_end.expect("tool call end present");
        assert_eq!(name, "file_read");
        assert_eq!(input.get("path"), Some(&"/a.txt".to_string()));
        assert!(matches!(events.last(), Some(StreamEvent::RunFinished { finish_reason: FinishReason::ToolCalls })));
    }

    #[test]
    fn hallucinated_turn_truncates_and_stops() {
        let raw = "OK\n\nHuman: pretend result";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let events = run_tokens(&chunks);

        assert_eq!(text_deltas(&events), "OK");
        assert!(matches!(events.last(), Some(StreamEvent::RunFinished { finish_reason: FinishReason::Stop })));
        // Nothing after TextMessageEnd except RunFinished.
        let end_pos = events.iter().position(|e| matches!(e, StreamEvent::TextMessageEnd { .. })).unwrap();
        assert_eq!(events.len(), end_pos + 2); // TextMessageEnd, RunFinished
    }

    #[test]
    fn at_most_one_inline_tool_call_per_response() {
        let raw = "<tool_use>{\"name\":\"a\",\"input\":{}}</tool_use><tool_use>{\"name\":\"b\",\"input\":{}}</tool_use>";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let events = run_tokens(&chunks);

        let tool_ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tool_ends, vec!["a".to_string()]);

        // The second block's raw XML must never leak out as a text delta.
        let deltas = text_deltas(&events);
        assert!(!deltas.contains("tool_use"));
        assert!(!deltas.contains("\"name\":\"b\""));
    }

    #[test]
    fn empty_deltas_are_suppressed() {
        let events = run_tokens(&["", "hi", ""]);
        let empty_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TextMessageContent { delta, .. } if delta.is_empty()))
            .count();
        assert_eq!(empty_count, 0);
    }

    #[test]
    fn stream_error_never_followed_by_run_finished() {
        let mut emitter = StreamingEmitter::new("run-1", "m");
        emitter.push_token("partial");
        emitter.finish_with_error("boom", Some("SERVER_ERROR".to_string()));
        let events = emitter.into_events();
        assert!(!matches!(events.last(), Some(StreamEvent::RunFinished { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::RunError { .. })));
    }

    #[test]
    fn no_tool_call_finishes_with_stop() {
        let events = run_tokens(&["just ", "plain ", "text"]);
        assert!(matches!(events.last(), Some(StreamEvent::RunFinished { finish_reason: FinishReason::Stop })));
        assert_eq!(text_deltas(&events), "just plain text");
    }

    #[test]
    fn utf8_multibyte_split_within_holdback_never_panics() {
        // Multi-byte chars right at the tail, pushed one byte-group at a time.
        let raw = "emoji: \u{1F600}\u{1F601}\u{1F602} done";
        let chunks: Vec<&str> = raw.split("").filter(|s| !s.is_empty()).collect();
        let _ = run_tokens(&chunks);
    }

    #[test]
    fn tag_split_across_every_boundary_never_panics() {
        let raw = "<tool_use>{\"name\":\"x\",\"input\":{}}</tool_use>";
        for split_at in 0..=raw.len() {
            if !raw.is_char_boundary(split_at) {
                continue;
            }
            let (a, b) = raw.split_at(split_at);
            let _ = run_tokens(&[a, b]);
        }
    }
}
