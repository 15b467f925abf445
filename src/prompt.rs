//! System-prompt composition (spec.md §4.10).
//!
//! Builds the per-request system prompt as an ordered sequence of sections:
//! base prompt, project guidelines (`agents.md`), a mode-specific addendum,
//! the active plan (code mode only), IDE output logs, and finally the
//! tool-description block with the `<tool_use>` output contract. Grounded on
//! the teacher's `prompt.rs` `SystemPrompt` builder (section methods
//! concatenated in `build()`), generalized from its project/intent sections
//! to spec.md's own section set.

use std::fs;
use std::path::Path;

use crate::loop_controller::Mode;
use crate::provider::ToolDescriptor;

/// First N characters of a top-level `agents.md` (case-insensitive), if
/// present.
pub fn read_agents_md(project_root: &Path, max_characters: usize) -> Option<String> {
    let entries = fs::read_dir(project_root).ok()?;
    let path = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.eq_ignore_ascii_case("agents.md")).unwrap_or(false))?;
    let content = fs::read_to_string(path).ok()?;
    Some(content.chars().take(max_characters).collect())
}

/// Content of the newest `.agent/plans/*-plan.md`, by filename (the
/// unix-ms prefix sorts chronologically).
pub fn latest_plan(project_root: &Path) -> Option<String> {
    let dir = project_root.join(".agent").join("plans");
    let mut entries: Vec<_> = fs::read_dir(&dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with("-plan.md")).unwrap_or(false))
        .collect();
    entries.sort();
    let newest = entries.pop()?;
    fs::read_to_string(newest).ok()
}

fn mode_addendum(mode: Mode) -> &'static str {
    match mode {
        Mode::Code => {
            "You are in code mode: make the requested file changes directly using the \
             available tools, then summarize what changed."
        }
        Mode::Plan => {
            "You are in plan mode: do not modify any files. Investigate the codebase with \
             read-only tools and produce a step-by-step plan as your final text response."
        }
        Mode::Ask => {
            "You are in ask mode: answer the question. Only use tools to gather context; do \
             not modify files."
        }
    }
}

fn tool_description_block(tools: &[ToolDescriptor]) -> String {
    let mut block = String::from(
        "You may call at most one tool per response. To call a tool, emit exactly one block \
         in this form and nothing else after it:\n\n\
         <tool_use>\n{\"name\": \"<tool_name>\", \"input\": { ... }}\n</tool_use>\n\n\
         Available tools:\n",
    );
    for tool in tools {
        block.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    block
}

/// Compose the full system prompt for one iteration's model call.
pub struct PromptInputs<'a> {
    pub base_prompt: &'a str,
    pub mode: Mode,
    pub project_root: &'a Path,
    pub agents_md_max_characters: usize,
    pub ide_output_logs: Option<&'a str>,
    pub tools: &'a [ToolDescriptor],
}

pub fn compose(inputs: &PromptInputs) -> String {
    let mut sections: Vec<String> = vec![inputs.base_prompt.to_string()];

    if let Some(guidelines) = read_agents_md(inputs.project_root, inputs.agents_md_max_characters) {
        sections.push(format!("# Project guidelines\n\n{guidelines}"));
    }

    sections.push(mode_addendum(inputs.mode).to_string());

    if matches!(inputs.mode, Mode::Code) {
        if let Some(plan) = latest_plan(inputs.project_root) {
            sections.push(format!("# Active plan\n\n{plan}"));
        }
    }

    if let Some(logs) = inputs.ide_output_logs {
        if !logs.is_empty() {
            sections.push(format!("# IDE output logs\n\n{logs}"));
        }
    }

    sections.push(tool_description_block(inputs.tools));

    sections.join("\n\n")
}
