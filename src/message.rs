//! Core data model: conversation messages, tool-call records, and the
//! typed event stream emitted by the streaming emitter and the loop
//! controller.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════
// MESSAGE HISTORY
// ═══════════════════════════════════════════════════════════════

/// One part of a multi-part user message (text or an image reference).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPart {
    Text { text: String },
    Image { reference: String },
}

/// Body of a `user` message: either a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

impl UserContent {
    pub fn as_text(&self) -> String {
        match self {
            UserContent::Text(t) => t.clone(),
            UserContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    UserPart::Text { text } => Some(text.as_str()),
                    UserPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            UserContent::Text(t) => t.chars().count(),
            UserContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    UserPart::Text { text } => text.chars().count(),
                    UserPart::Image { reference } => reference.chars().count(),
                })
                .sum(),
        }
    }
}

/// A single tool invocation recorded on an `assistant` message.
///
/// `arguments_json` carries the tool's arguments exactly as the model
/// emitted them — same key order, same value types — taken from
/// `ParsedToolCall::arguments_json` rather than re-serialized from the
/// executor-facing `BTreeMap<String, String>`, so re-encoding it into the
/// prompt on a later turn doesn't alphabetize keys or stringify numbers and
/// booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// A tagged conversation message, matching spec.md §3's `Message` variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        content: UserContent,
        /// Set when this user turn is feeding back a mutation-tool failure;
        /// consulted by the divergence detector's `mutation_failure_loop`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mutation_failure_tag: Option<String>,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRecord>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User {
            content: UserContent::Text(text.into()),
            mutation_failure_tag: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tools(text: Option<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Message::Assistant { text, tool_calls }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Total textual character length across every field, used by the
    /// context manager's `ceil(chars / 4)` token estimate.
    pub fn char_len(&self) -> usize {
        match self {
            Message::User { content, mutation_failure_tag } => {
                content.char_len() + mutation_failure_tag.as_ref().map_or(0, |s| s.chars().count())
            }
            Message::Assistant { text, tool_calls } => {
                let text_len = text.as_ref().map_or(0, |t| t.chars().count());
                let calls_len: usize = tool_calls
                    .iter()
                    .map(|c| c.name.chars().count() + c.arguments_json.chars().count())
                    .sum();
                text_len + calls_len
            }
            Message::Tool { content, .. } => content.chars().count(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }
}

// ═══════════════════════════════════════════════════════════════
// PARSED TOOL CALL (internal to the extractor)
// ═══════════════════════════════════════════════════════════════

/// A tool invocation as parsed out of free-form model text, before it is
/// assigned a call id and turned into a `ToolCallRecord`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    /// Stringified for the executor's untyped `(name, input_map)` interface
    /// (spec.md §4.2); non-string values are JSON-serialized into strings
    /// here, which is lossy by design for this map. `arguments_json` below
    /// is the field that preserves types and order.
    pub input: std::collections::BTreeMap<String, String>,
    /// The arguments object as the model actually emitted it — same key
    /// order, same value types (numbers/bools/nested structures) — so it
    /// can be re-encoded into the prompt on a later turn without the lossy
    /// round-trip `input` above would produce.
    pub arguments_json: String,
}

// ═══════════════════════════════════════════════════════════════
// STREAM EVENTS
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    RunStarted {
        run_id: String,
        model: String,
    },
    TextMessageStart {
        message_id: String,
    },
    TextMessageContent {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
        index: usize,
    },
    ToolCallArgs {
        call_id: String,
        delta: String,
    },
    ToolCallEnd {
        call_id: String,
        name: String,
        input: std::collections::BTreeMap<String, String>,
    },
    Custom {
        name: String,
        data: serde_json::Value,
    },
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    RunFinished {
        finish_reason: FinishReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_content_text_char_len() {
        let c = UserContent::Text("hello".into());
        assert_eq!(c.char_len(), 5);
    }

    #[test]
    fn user_content_parts_as_text_skips_images() {
        let c = UserContent::Parts(vec![
            UserPart::Text { text: "a".into() },
            UserPart::Image { reference: "img://x".into() },
            UserPart::Text { text: "b".into() },
        ]);
        assert_eq!(c.as_text(), "a\nb");
    }

    #[test]
    fn message_char_len_counts_tool_calls() {
        let msg = Message::assistant_with_tools(
            Some("hi".into()),
            vec![ToolCallRecord {
                id: "1".into(),
                name: "read".into(),
                arguments_json: r#"{"path":"a"}"#.into(),
            }],
        );
        // "hi" (2) + "read" (4) + json (12)
        assert_eq!(msg.char_len(), 2 + 4 + 12);
    }

    #[test]
    fn finish_reason_display() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::ToolCalls.to_string(), "tool_calls");
    }

    #[test]
    fn message_round_trips_through_serde() {
        let msg = Message::tool_result("call-1", "ok");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
