//! Agentic tool-use loop core: parsing, streaming, retry, divergence
//! detection, context budgeting, token accounting, structured logging,
//! file-change snapshots, and the loop controller that drives them.
//!
//! Transport (HTTP to a model) and filesystem access (tool execution) are
//! named out of scope; a host application implements the `ModelProvider`
//! and `ToolExecutor` trait boundaries in `provider` and wires them into
//! `loop_controller::AgentLoop`.

pub mod config;
pub mod context;
pub mod divergence;
pub mod error;
pub mod json_repair;
pub mod logger;
pub mod loop_controller;
pub mod message;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod snapshot;
pub mod streaming;
pub mod tokens;
pub mod tool_parser;

pub use config::RunConfig;
pub use error::ProviderError;
pub use loop_controller::{AgentLoop, Mode, RunOutcome, RunRequest};
pub use message::{FinishReason, Message, StreamEvent, ToolCallRecord, UserContent, UserPart};
pub use provider::{
    FileAction, FileChange, ModelProvider, ProviderChunk, ToolContext, ToolDescriptor,
    ToolErrorCode, ToolExecutionError, ToolExecutor, ToolInput, ToolOutcome, TokenStream,
    USER_QUESTION_TOOL,
};
pub use tokens::{TokenTracker, TurnUsage, UsageTotals};
