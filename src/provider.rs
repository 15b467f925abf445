//! External interfaces (spec.md §6).
//!
//! The core never speaks HTTP and never touches the filesystem on a tool's
//! behalf — both are named out of scope (spec.md §1). Instead it defines two
//! trait boundaries a host application implements: `ModelProvider` streams
//! raw text chunks from whatever transport it owns, `ToolExecutor` carries
//! out a parsed tool call against whatever filesystem/sandbox it owns. Tests
//! for the loop controller drive these with scripted fakes (spec.md §9).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{Message, StreamEvent};
use crate::tokens::TurnUsage;

pub type ToolInput = BTreeMap<String, String>;

/// One item off the model stream: either a raw UTF-8 text fragment or a
/// terminal usage report (providers that report usage mid-stream, e.g. on
/// their own final SSE event, surface it this way rather than out-of-band).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    Text(String),
    Usage(TurnUsage),
}

/// A chunk stream from the model, as the excluded transport layer would
/// produce it. Each item is a chunk or a terminal error.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderError>> + Send>>;

/// Describes one tool to the model: name, prose description, and a
/// JSON-schema-derived parameter sketch, embedded in the prompt's tool
/// contract block (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Given `(messages, system_prompts, tool_descriptors, max_tokens)`, produce
/// an asynchronous sequence of raw text chunks (spec.md §6).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream(
        &self,
        messages: &[Message],
        system_prompts: &[String],
        tool_descriptors: &[ToolDescriptor],
        max_tokens: u64,
    ) -> Result<TokenStream, ProviderError>;
}

/// Classified codes a tool executor can raise, beyond a plain text failure
/// (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolErrorCode {
    InvalidPath,
    FileNotFound,
    FileNotRead,
    NoMatch,
    NotAllowed,
    InvalidRegex,
    MissingInput,
    Other(String),
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ToolErrorCode::InvalidPath => "INVALID_PATH",
            ToolErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ToolErrorCode::FileNotRead => "FILE_NOT_READ",
            ToolErrorCode::NoMatch => "NO_MATCH",
            ToolErrorCode::NotAllowed => "NOT_ALLOWED",
            ToolErrorCode::InvalidRegex => "INVALID_REGEX",
            ToolErrorCode::MissingInput => "MISSING_INPUT",
            ToolErrorCode::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("tool error [{}]: {message}", code.as_str())]
pub struct ToolExecutionError {
    pub code: ToolErrorCode,
    pub message: String,
}

impl ToolExecutionError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        ToolExecutionError { code, message: message.into() }
    }
}

/// What a mutation tool reports about one file it touched, so the loop's
/// snapshot manager (C9) can capture pre-change content and the caller can
/// render a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_content: Option<String>,
    #[serde(default)]
    pub is_binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Edit,
    Delete,
    Move,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Edit => "edit",
            FileAction::Delete => "delete",
            FileAction::Move => "move",
        }
    }
}

/// The result of one tool invocation, before it's serialized back into a
/// `tool` message.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Text(String),
    Structured { output: String, metadata: Option<serde_json::Value>, title: Option<String> },
}

impl ToolOutcome {
    pub fn as_text(&self) -> &str {
        match self {
            ToolOutcome::Text(s) => s,
            ToolOutcome::Structured { output, .. } => output,
        }
    }
}

/// Per-call context handed to the executor: where the project lives and
/// which iteration this call belongs to.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub project_root: PathBuf,
    pub iteration: u32,
}

/// `user_question` is distinguished: the loop controller checks the tool
/// name directly and terminates after the call returns (spec.md §6).
pub const USER_QUESTION_TOOL: &str = "user_question";

/// Carries out one parsed tool call. Implementations may push `Custom`
/// events (e.g. `file_changed`) onto `emit`; the loop drains them between
/// calls (spec.md §6).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        input: &ToolInput,
        emit: &mpsc::UnboundedSender<StreamEvent>,
        context: &ToolContext,
    ) -> Result<ToolOutcome, ToolExecutionError>;

    /// Whether this tool name can modify a file on disk. Mutation-tool
    /// failures feed `mutation_failure_loop` (spec.md §4.5); `same_tool_loop`
    /// excludes the complementary read-only set instead (spec.md §4.5's
    /// `read_only_tools` config).
    fn is_mutation(&self, name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_code_as_str_matches_spec_codes() {
        assert_eq!(ToolErrorCode::InvalidPath.as_str(), "INVALID_PATH");
        assert_eq!(ToolErrorCode::MissingInput.as_str(), "MISSING_INPUT");
    }

    #[test]
    fn file_action_as_str() {
        assert_eq!(FileAction::Create.as_str(), "create");
        assert_eq!(FileAction::Move.as_str(), "move");
    }

    #[test]
    fn tool_outcome_as_text_unwraps_structured() {
        let o = ToolOutcome::Structured {
            output: "done".into(),
            metadata: None,
            title: Some("t".into()),
        };
        assert_eq!(o.as_text(), "done");
    }
}
