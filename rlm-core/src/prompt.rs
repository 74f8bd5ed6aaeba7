//! Prompt construction from a call's transcript.

use rlm_common::TranscriptEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

const REPL_SYSTEM_PROMPT: &str = "You solve tasks by writing code in an isolated sandbox.\n\
Each turn, reply with exactly one fenced code block to run, or submit your\n\
answer with FINAL(\"...\"). The variables `query` and `context` are already\n\
set in the sandbox. Print anything you want to observe; unprinted values\n\
are not shown. Call llm_query(question) from code to delegate a\n\
sub-problem to another model call, and budget() to check remaining\n\
resources.";

const EXTRACT_SYSTEM_PROMPT: &str = "You are out of iterations. Based on the work so far, submit your best\n\
answer now as FINAL(\"...\"). Do not write any more code.";

const EMPTY_OUTPUT_NOTE: &str = "(no output - did you forget to print?)";

const NO_CODE_NOTE: &str = "(no code block found - reply with a fenced code block or FINAL(\"...\"))";

const CONTEXT_PREVIEW_CHARS: usize = 2_000;

/// Messages for one iteration of the generate/execute loop: system
/// instructions, the task, then the transcript as alternating
/// assistant turns and execution-output user turns.
pub fn build_repl_prompt(
    query: &str,
    context: &str,
    transcript: &[TranscriptEntry],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 + transcript.len() * 2);
    messages.push(ChatMessage::system(REPL_SYSTEM_PROMPT));

    let mut task = format!("Query: {query}");
    if !context.is_empty() {
        let preview: String = context.chars().take(CONTEXT_PREVIEW_CHARS).collect();
        let omitted = context.chars().count().saturating_sub(CONTEXT_PREVIEW_CHARS);
        task.push_str("\n\nContext preview:\n");
        task.push_str(&preview);
        if omitted > 0 {
            task.push_str(&format!(
                "\n[... {omitted} more characters in the `context` variable]"
            ));
        }
    }
    messages.push(ChatMessage::user(task));

    for entry in transcript {
        messages.push(ChatMessage::assistant(entry.assistant_response.clone()));
        let feedback = match &entry.execution_output {
            Some(output) if output.is_empty() => {
                format!("[Execution Output]\n{EMPTY_OUTPUT_NOTE}")
            }
            Some(output) => format!("[Execution Output]\n{output}"),
            None => NO_CODE_NOTE.to_string(),
        };
        messages.push(ChatMessage::user(feedback));
    }
    messages
}

/// One-shot "answer now" prompt for the extract fallback. No tools, no
/// sandbox: just the work so far and a demand for FINAL.
pub fn build_extract_prompt(query: &str, transcript: &[TranscriptEntry]) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(EXTRACT_SYSTEM_PROMPT),
        ChatMessage::user(format!("Query: {query}")),
    ];
    for entry in transcript {
        messages.push(ChatMessage::assistant(entry.assistant_response.clone()));
        if let Some(output) = &entry.execution_output {
            messages.push(ChatMessage::user(format!("[Execution Output]\n{output}")));
        }
    }
    messages.push(ChatMessage::user(
        "Submit your answer now: FINAL(\"...\")".to_string(),
    ));
    messages
}

/// Cap execution output at `max_chars` characters, appending a marker
/// that says how much was cut.
pub fn truncate_execution_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    let omitted = total - max_chars;
    format!("{kept}\n[... output truncated, {omitted} of {total} characters omitted]")
}
