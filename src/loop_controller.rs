//! C10 — Agent loop controller.
//!
//! Orchestrates C1–C9: build prompt → stream → parse → execute tools → feed
//! results back → check stop conditions (spec.md §4.10). Grounded on the
//! teacher's `agent.rs::run_agent_loop`/`AgentCore` (iteration loop, mpsc
//! event channel, named config variants) and `zeph-core`'s
//! `process_response` (budget check, doom-loop check, tool-result
//! feed-back) — the teacher's single hardcoded loop is generalized into
//! spec.md's full termination-condition set.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::context;
use crate::divergence::{CallRecord, DivergenceDetector, IterationRecord};
use crate::error::ProviderError;
use crate::logger::{LogCategory, LogLevel, StructuredLogger};
use crate::message::{Message, StreamEvent, ToolCallRecord};
use crate::prompt::{self, PromptInputs};
use crate::provider::{
    FileChange, ModelProvider, ProviderChunk, ToolContext, ToolDescriptor, ToolExecutor,
    USER_QUESTION_TOOL,
};
use crate::retry;
use crate::snapshot::SnapshotManager;
use crate::streaming::StreamingEmitter;
use crate::tokens::TokenTracker;

/// The three run modes, threading through prompt composition and
/// termination behaviour (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Code,
    Plan,
    Ask,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Code => "code",
            Mode::Plan => "plan",
            Mode::Ask => "ask",
        }
    }
}

/// Everything one call to `AgentLoop::run` needs.
pub struct RunRequest {
    pub initial_messages: Vec<Message>,
    pub mode: Mode,
    pub model: String,
    pub project_root: PathBuf,
    pub session_id: Option<String>,
    pub ide_output_logs: Option<String>,
    pub base_prompt: String,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u64,
}

/// Summary of how the run ended, for callers that want it beyond the event
/// stream itself.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub iterations: u32,
    pub doom_loop_detected: bool,
    pub hit_iteration_limit: bool,
    pub aborted: bool,
    pub debug_log_id: String,
    /// Which divergence detector ended the run, if any: one of
    /// `"doom_loop" | "same_tool_loop" | "failure_loop" | "no_progress" |
    /// "mutation_failure_loop"`. `None` when the run ended for any other
    /// reason (no tool call, iteration cap, user question, cancellation,
    /// error).
    pub diverged_detector: Option<String>,
}

enum StopReason {
    Cancelled,
    RunError,
    Divergence(DivergenceHit),
    UserQuestion,
    NoToolCalls,
    IterationLimit,
}

struct DivergenceHit {
    detector: &'static str,
    detail: String,
}

impl DivergenceHit {
    fn status_message(&self) -> String {
        if self.detail.is_empty() {
            format!("Diverging ({}): threshold reached", self.detector)
        } else {
            format!("Diverging ({}): tool '{}'", self.detector, self.detail)
        }
    }
}

/// Drives the bounded iteration process against a `ModelProvider` and a
/// `ToolExecutor` (spec.md §4.10). Fresh per request, per spec.md §5's
/// single-threaded-per-request ownership model.
pub struct AgentLoop<P: ModelProvider, T: ToolExecutor> {
    provider: P,
    executor: T,
    config: RunConfig,
}

impl<P: ModelProvider, T: ToolExecutor> AgentLoop<P, T> {
    pub fn new(provider: P, executor: T, config: RunConfig) -> Self {
        AgentLoop { provider, executor, config }
    }

    pub async fn run(
        &self,
        request: RunRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let mut logger = StructuredLogger::new(
            run_id.clone(),
            request.session_id.clone(),
            request.project_root.display().to_string(),
            request.model.clone(),
            request.mode.as_str(),
        );
        let mut divergence = DivergenceDetector::new();
        let mut tokens = TokenTracker::new();
        let mut messages = request.initial_messages.clone();
        let mut last_assistant_text = String::new();

        send(&event_tx, status("Starting..."));

        let mut snapshot = if matches!(request.mode, Mode::Code) {
            let last_user = last_user_text(&messages).unwrap_or_default();
            match SnapshotManager::init(&request.project_root, &last_user, now_unix_ms(), self.config.max_snapshots) {
                Ok((mgr, event)) => {
                    send(&event_tx, event);
                    Some(mgr)
                }
                Err(e) => {
                    eprintln!("snapshot init failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let system_prompt = prompt::compose(&PromptInputs {
            base_prompt: &request.base_prompt,
            mode: request.mode,
            project_root: &request.project_root,
            agents_md_max_characters: self.config.agents_md_max_characters,
            ide_output_logs: request.ide_output_logs.as_deref(),
            tools: &request.tools,
        });

        let mut iteration: u32 = 0;
        let mut stop_reason: Option<StopReason> = None;

        loop {
            if iteration >= self.config.max_iterations {
                stop_reason = Some(StopReason::IterationLimit);
                break;
            }
            if *cancel.borrow() {
                send(&event_tx, status("Interrupted"));
                stop_reason = Some(StopReason::Cancelled);
                break;
            }
            send(&event_tx, status("Thinking..."));

            let estimated = context::estimate_tokens(&messages);
            if !context::has_budget(estimated, self.config.context_window, self.config.max_output) {
                if let Some(result) = context::prune(&messages) {
                    send(&event_tx, status(&format!("Pruned {} tokens of old tool output", result.pruned_tokens)));
                    messages = result.messages;
                    logger.log(
                        LogLevel::Info,
                        LogCategory::Context,
                        "pruned",
                        Some(serde_json::json!({ "pruned_tokens": result.pruned_tokens })),
                        Some(iteration),
                        None,
                    );
                }
            }

            let stream = match self
                .call_with_retry(&messages, &system_prompt, &request.tools, request.max_tokens, &event_tx, &mut cancel)
                .await
            {
                Ok(stream) => stream,
                Err(ProviderError::Cancelled) => {
                    send(&event_tx, status("Interrupted"));
                    stop_reason = Some(StopReason::Cancelled);
                    break;
                }
                Err(err) => {
                    logger.log(
                        LogLevel::Error,
                        LogCategory::Llm,
                        "model_call_failed",
                        Some(serde_json::json!({ "message": err.to_string() })),
                        Some(iteration),
                        None,
                    );
                    send(&event_tx, StreamEvent::RunError { message: err.to_string(), code: err.code().map(|s| s.to_string()) });
                    stop_reason = Some(StopReason::RunError);
                    break;
                }
            };

            let (events, stream_failed, usage) =
                consume_stream(stream, run_id.clone(), request.model.clone(), &mut cancel).await;

            if let Some(u) = usage {
                tokens.record_turn(u);
                logger.record_tokens(u.input_tokens, u.output_tokens);
            }

            let mut pending_args: HashMap<String, String> = HashMap::new();
            let mut tool_calls_this_turn: Vec<(String, String, std::collections::BTreeMap<String, String>, String)> =
                Vec::new();

            for event in events {
                match &event {
                    StreamEvent::TextMessageContent { delta, .. } => {
                        if !delta.is_empty() {
                            last_assistant_text.push_str(delta);
                        }
                    }
                    StreamEvent::ToolCallArgs { call_id, delta } => {
                        pending_args.insert(call_id.clone(), delta.clone());
                    }
                    StreamEvent::ToolCallEnd { call_id, name, input } => {
                        let args_json =
                            pending_args.remove(call_id).unwrap_or_else(|| serde_json::to_string(input).unwrap_or_default());
                        tool_calls_this_turn.push((call_id.clone(), name.clone(), input.clone(), args_json));
                        logger.record_tool_call(name);
                    }
                    _ => {}
                }
                send(&event_tx, event);
            }

            if stream_failed {
                stop_reason = Some(StopReason::RunError);
                break;
            }

            let mut iteration_had_file_change = false;
            let mut iteration_had_mutation_failure = false;
            let mut user_question_fired = false;
            let mut tool_call_records = Vec::new();
            let mut tool_result_messages = Vec::new();

            for (call_id, name, input, args_json) in &tool_calls_this_turn {
                let (tool_tx, mut tool_rx) = mpsc::unbounded_channel::<StreamEvent>();
                let ctx = ToolContext { project_root: request.project_root.clone(), iteration };
                let result = self.executor.execute(name, input, &tool_tx, &ctx).await;
                drop(tool_tx);

                let is_mutation = self.executor.is_mutation(name);
                let success = result.is_ok();
                divergence.record_call(CallRecord { name: name.clone(), arguments_json: args_json.clone(), success, is_mutation });
                if !success && is_mutation {
                    iteration_had_mutation_failure = true;
                }
                if !success {
                    logger.log(
                        LogLevel::Warning,
                        LogCategory::ToolCall,
                        "tool_failed",
                        Some(serde_json::json!({ "name": name })),
                        Some(iteration),
                        None,
                    );
                }

                let result_text = match &result {
                    Ok(outcome) => outcome.as_text().to_string(),
                    Err(e) => format!("Error [{}]: {}", e.code.as_str(), e.message),
                };

                while let Ok(queued) = tool_rx.try_recv() {
                    if let StreamEvent::Custom { name: ev_name, data } = &queued {
                        if ev_name == "file_changed" {
                            iteration_had_file_change = true;
                            if let Some(mgr) = snapshot.as_mut() {
                                if let Ok(change) = serde_json::from_value::<FileChange>(data.clone()) {
                                    let _ = mgr.capture(&change.path, change.action, change.before_content.as_deref());
                                }
                            }
                        }
                    }
                    send(&event_tx, queued);
                }

                tool_call_records.push(ToolCallRecord { id: call_id.clone(), name: name.clone(), arguments_json: args_json.clone() });
                tool_result_messages.push(Message::tool_result(call_id.clone(), result_text));

                if name == USER_QUESTION_TOOL {
                    user_question_fired = true;
                }
            }

            if !tool_call_records.is_empty() {
                let assistant_text = if last_assistant_text.trim().is_empty() { None } else { Some(last_assistant_text.clone()) };
                messages.push(Message::assistant_with_tools(assistant_text, tool_call_records.clone()));
                messages.extend(tool_result_messages);
                last_assistant_text.clear();
            }
            // When no tool calls fired this iteration the loop breaks right
            // below (`NoToolCalls`), so `last_assistant_text` is left intact
            // for the plan-mode persist check after the loop.

            divergence.record_iteration(IterationRecord {
                had_file_change: iteration_had_file_change,
                had_mutation_failure: iteration_had_mutation_failure,
            });
            logger.record_iteration();
            iteration += 1;

            if let Some(hit) = check_divergence(&divergence, &self.config) {
                send(&event_tx, status(&hit.status_message()));
                stop_reason = Some(StopReason::Divergence(hit));
                break;
            }

            if user_question_fired {
                stop_reason = Some(StopReason::UserQuestion);
                break;
            }
            if tool_call_records.is_empty() {
                stop_reason = Some(StopReason::NoToolCalls);
                break;
            }
        }

        let aborted = matches!(stop_reason, Some(StopReason::Cancelled));
        let diverged_detector = match &stop_reason {
            Some(StopReason::Divergence(hit)) => Some(hit.detector.to_string()),
            _ => None,
        };

        match &stop_reason {
            Some(StopReason::IterationLimit) => {
                logger.mark_hit_iteration_limit();
                send(
                    &event_tx,
                    StreamEvent::Custom {
                        name: "max_iterations_reached".to_string(),
                        data: serde_json::json!({ "iterations": self.config.max_iterations }),
                    },
                );
            }
            Some(StopReason::Divergence(hit)) if hit.detector == "doom_loop" => {
                logger.mark_doom_loop_detected();
            }
            Some(StopReason::Cancelled) => {
                logger.mark_aborted();
            }
            _ => {}
        }

        if matches!(request.mode, Mode::Plan) && !aborted && !last_assistant_text.trim().is_empty() {
            if let Some(plan_event) = persist_plan(&request.project_root, &messages, &last_assistant_text) {
                send(&event_tx, plan_event);
            }
        }

        if let Some(mgr) = snapshot.as_ref() {
            let _ = mgr.cleanup_if_empty();
        }

        if tokens.any_recorded() {
            let totals = tokens.totals();
            send(
                &event_tx,
                StreamEvent::Custom {
                    name: "usage".to_string(),
                    data: serde_json::json!({
                        "input_tokens": totals.input_tokens,
                        "output_tokens": totals.output_tokens,
                        "cache_read_tokens": totals.cache_read_tokens,
                        "cache_write_tokens": totals.cache_write_tokens,
                        "turns": totals.turns,
                    }),
                },
            );
        }

        let _ = logger.flush(&request.project_root, self.config.max_debug_logs);
        send(&event_tx, StreamEvent::Custom { name: "debug_log".to_string(), data: serde_json::json!({ "id": logger.id() }) });

        RunOutcome {
            iterations: iteration,
            doom_loop_detected: logger.summary().doom_loop_detected,
            hit_iteration_limit: logger.summary().hit_iteration_limit,
            aborted: logger.summary().aborted,
            debug_log_id: logger.id().to_string(),
            diverged_detector,
        }
    }

    async fn call_with_retry(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDescriptor],
        max_tokens: u64,
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<crate::provider::TokenStream, ProviderError> {
        let system_prompts = [system_prompt.to_string()];
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.provider.stream(messages, &system_prompts, tools, max_tokens).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    let reason = retry::classify(&err);
                    let retryable = reason.is_some();
                    if !retryable || attempt >= self.config.max_retry_attempts {
                        return Err(err);
                    }
                    let reason = reason.unwrap();
                    send(event_tx, status(&format!("Retrying ({reason})…")));
                    let delay = retry::delay_for(&err, attempt);
                    if retry::cancellable_sleep(delay, cancel).await.is_err() {
                        return Err(ProviderError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Drive one model response to completion, forwarding raw chunks into the
/// streaming emitter. Returns the emitted events, whether the stream ended
/// in error, and any usage chunk observed.
async fn consume_stream(
    stream: crate::provider::TokenStream,
    run_id: String,
    model: String,
    cancel: &mut watch::Receiver<bool>,
) -> (Vec<StreamEvent>, bool, Option<crate::tokens::TurnUsage>) {
    let mut emitter = StreamingEmitter::new(run_id, model);
    let mut usage = None;
    let mut failed = false;
    tokio::pin!(stream);

    loop {
        if *cancel.borrow() {
            break;
        }
        match stream.next().await {
            None => break,
            Some(Ok(ProviderChunk::Text(text))) => {
                if !emitter.push_token(&text) {
                    break;
                }
            }
            Some(Ok(ProviderChunk::Usage(u))) => {
                usage = Some(u);
            }
            Some(Err(e)) => {
                emitter.finish_with_error(e.to_string(), e.code().map(|s| s.to_string()));
                failed = true;
                break;
            }
        }
    }

    if !failed {
        emitter.finish_stream();
    }

    (emitter.into_events(), failed, usage)
}

fn check_divergence(detector: &DivergenceDetector, config: &RunConfig) -> Option<DivergenceHit> {
    if let Some(name) = detector.doom_loop(config) {
        return Some(DivergenceHit { detector: "doom_loop", detail: name });
    }
    if let Some(name) = detector.same_tool_loop(config) {
        return Some(DivergenceHit { detector: "same_tool_loop", detail: name });
    }
    if let Some(name) = detector.failure_loop(config) {
        return Some(DivergenceHit { detector: "failure_loop", detail: name });
    }
    // An identical-call pattern one call away from tripping doom_loop or
    // same_tool_loop takes priority over the shorter-window iteration-based
    // checks below, so such a loop is always reported as doom_loop/
    // same_tool_loop rather than preempted by no_progress on the
    // second-to-last iteration.
    if detector.doom_loop_imminent(config) || detector.same_tool_loop_imminent(config) {
        return None;
    }
    // mutation_failure_loop is checked ahead of no_progress (and its
    // imminent form masks no_progress too): an iteration with a mutation
    // failure never counts as a file change either, so the two windows
    // routinely fill on the same iteration (spec.md §8 scenario 5's
    // interleaved read+failing-file_patch run reaches both at iteration 2).
    // Without this ordering no_progress's equal-or-shorter window always
    // wins and the run is misattributed to "no progress" instead of the
    // more specific mutation-failure signal.
    if detector.mutation_failure_loop(config) {
        return Some(DivergenceHit { detector: "mutation_failure_loop", detail: String::new() });
    }
    if detector.mutation_failure_loop_imminent(config) {
        return None;
    }
    if detector.no_progress(config) {
        return Some(DivergenceHit { detector: "no_progress", detail: String::new() });
    }
    None
}

fn persist_plan(project_root: &Path, messages: &[Message], last_assistant_text: &str) -> Option<StreamEvent> {
    let header = first_user_text(messages).unwrap_or_default();
    let plans_dir = project_root.join(".agent").join("plans");
    fs::create_dir_all(&plans_dir).ok()?;
    let ts = now_unix_ms();
    let path = plans_dir.join(format!("{ts}-plan.md"));
    let content = format!("# Plan for: {header}\n\n{last_assistant_text}");
    fs::write(&path, content).ok()?;
    Some(StreamEvent::Custom {
        name: "plan_created".to_string(),
        data: serde_json::json!({ "path": path.display().to_string() }),
    })
}

fn last_user_text(messages: &[Message]) -> Option<String> {
    messages.iter().rev().find_map(|m| match m {
        Message::User { content, .. } => Some(content.as_text()),
        _ => None,
    })
}

fn first_user_text(messages: &[Message]) -> Option<String> {
    messages.iter().find_map(|m| match m {
        Message::User { content, .. } => Some(content.as_text()),
        _ => None,
    })
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn status(message: &str) -> StreamEvent {
    StreamEvent::Custom { name: "status".to_string(), data: serde_json::json!({ "message": message }) }
}

fn send(tx: &mpsc::UnboundedSender<StreamEvent>, event: StreamEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ToolExecutionError, ToolErrorCode, ToolInput, ToolOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn stream(
            &self,
            _messages: &[Message],
            _system_prompts: &[String],
            _tools: &[ToolDescriptor],
            _max_tokens: u64,
        ) -> Result<crate::provider::TokenStream, ProviderError> {
            let tokens = self.responses.lock().unwrap().remove(0);
            let items: Vec<Result<ProviderChunk, ProviderError>> =
                tokens.into_iter().map(|t| Ok(ProviderChunk::Text(t.to_string()))).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(
            &self,
            name: &str,
            input: &ToolInput,
            _emit: &mpsc::UnboundedSender<StreamEvent>,
            _context: &ToolContext,
        ) -> Result<ToolOutcome, ToolExecutionError> {
            if name == "always_fails" {
                return Err(ToolExecutionError::new(ToolErrorCode::FileNotFound, "no such file"));
            }
            Ok(ToolOutcome::Text(format!("ran {name} with {input:?}")))
        }

        fn is_mutation(&self, name: &str) -> bool {
            name == "file_patch" || name == "always_fails"
        }
    }

    fn req(tmp: &std::path::Path) -> RunRequest {
        RunRequest {
            initial_messages: vec![Message::user_text("do the thing")],
            mode: Mode::Code,
            model: "test-model".into(),
            project_root: tmp.to_path_buf(),
            session_id: None,
            ide_output_logs: None,
            base_prompt: "You are a coding agent.".into(),
            tools: vec![],
            max_tokens: 4096,
        }
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn no_tool_call_response_ends_run_with_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider { responses: Mutex::new(vec![vec!["All done, nothing to do."]]) };
        let agent = AgentLoop::new(provider, EchoExecutor, RunConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let events = drain(rx).await;
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.hit_iteration_limit);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::RunFinished { finish_reason } if finish_reason.as_str() == "stop")));
    }

    #[tokio::test]
    async fn single_tool_call_executes_and_feeds_back() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider {
            responses: Mutex::new(vec![
                vec!["Reading.\n<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\"}}\n</tool_use>\nDone."],
                vec!["All finished now."],
            ]),
        };
        let agent = AgentLoop::new(provider, EchoExecutor, RunConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let events = drain(rx).await;
        assert_eq!(outcome.iterations, 2);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolCallEnd { name, .. } if name == "file_read")));
    }

    #[tokio::test]
    async fn doom_loop_terminates_after_window_identical_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let call = "<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\"}}\n</tool_use>";
        let provider = ScriptedProvider { responses: Mutex::new(vec![vec![call]; 5]) };
        let mut config = RunConfig::default();
        config.max_iterations = 10;
        let agent = AgentLoop::new(provider, EchoExecutor, config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let events = drain(rx).await;
        assert!(outcome.doom_loop_detected);
        assert!(!outcome.hit_iteration_limit);
        assert_eq!(outcome.diverged_detector.as_deref(), Some("doom_loop"));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Custom { name, data } if name == "status" && data["message"].as_str().unwrap_or("").contains("file_read"))));
    }

    #[tokio::test]
    async fn cancellation_before_first_iteration_is_clean_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider { responses: Mutex::new(vec![]) };
        let agent = AgentLoop::new(provider, EchoExecutor, RunConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(true);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let events = drain(rx).await;
        assert!(outcome.aborted);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Custom{name, data} if name=="status" && data["message"] == "Interrupted")));
    }

    #[tokio::test]
    async fn mutation_failure_loop_outranks_no_progress_at_same_iteration() {
        // Two iterations of a failing mutation tool trip no_progress (no
        // file change either iteration) and mutation_failure_loop (default
        // windows both 2) on the same iteration; mutation_failure_loop is
        // the more specific signal and must win (spec.md §8 scenario 5).
        let tmp = tempfile::tempdir().unwrap();
        let calls = vec![
            vec!["<tool_use>\n{\"name\":\"always_fails\",\"input\":{\"path\":\"a.rs\"}}\n</tool_use>"],
            vec!["<tool_use>\n{\"name\":\"always_fails\",\"input\":{\"path\":\"b.rs\"}}\n</tool_use>"],
        ];
        let provider = ScriptedProvider { responses: Mutex::new(calls) };
        let mut config = RunConfig::default();
        config.same_tool_loop_window = 100;
        config.failure_loop_window = 100;
        let agent = AgentLoop::new(provider, EchoExecutor, config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let _events = drain(rx).await;
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.diverged_detector.as_deref(), Some("mutation_failure_loop"));
    }

    #[tokio::test]
    async fn max_iterations_reached_emits_event() {
        let tmp = tempfile::tempdir().unwrap();
        let call = "<tool_use>\n{\"name\":\"file_read\",\"input\":{\"path\":\"/a.txt\", \"n\": \"%N%\"}}\n</tool_use>";
        let mut config = RunConfig::default();
        config.max_iterations = 3;
        config.same_tool_loop_window = 100;
        let responses: Vec<Vec<&'static str>> = (0..3)
            .map(|i| vec![Box::leak(call.replace("%N%", &i.to_string()).into_boxed_str()) as &'static str])
            .collect();
        let provider = ScriptedProvider { responses: Mutex::new(responses) };
        let agent = AgentLoop::new(provider, EchoExecutor, config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = agent.run(req(tmp.path()), tx, cancel_rx).await;
        let events = drain(rx).await;
        assert!(outcome.hit_iteration_limit);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Custom { name, .. } if name == "max_iterations_reached")));
    }
}
