//! Pure text functions over model responses: code block extraction, final
//! answer detection, and the history rendering of an iteration.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex_lite::Regex;
use rlm_core::{ExecutionResult, Iteration, Message};

static CODE_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?ms)^[ \t]*```repl[ \t]*\r?\n(.*?)^[ \t]*```").ok());

static FINAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?ms)^[ \t]*FINAL\((.*?)\)[ \t]*\r?$").ok());

static FINAL_VAR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*FINAL_VAR\([ \t]*["']?([A-Za-z_][A-Za-z0-9_]*)["']?[ \t]*\)"#).ok()
});

/// A final-answer marker found in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalAnswer {
    /// `FINAL(<answer>)`
    Text(String),
    /// `FINAL_VAR(<name>)`
    Variable(String),
}

/// Code of every ```` ```repl ```` block, in document order.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    let Some(re) = CODE_BLOCK.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| {
            let code = m.as_str();
            code.strip_suffix('\n')
                .map(|c| c.strip_suffix('\r').unwrap_or(c))
                .unwrap_or(code)
                .to_string()
        })
        .collect()
}

/// Scan for a final-answer marker outside code blocks.
///
/// Markers must start a line. When both kinds appear, the earlier wins.
pub fn find_final_answer(text: &str) -> Option<FinalAnswer> {
    let prose = match CODE_BLOCK.as_ref() {
        Some(re) => re.replace_all(text, ""),
        None => Cow::Borrowed(text),
    };

    let text_marker = FINAL
        .as_ref()
        .and_then(|re| re.captures(&prose))
        .and_then(|c| Some((c.get(0)?.start(), FinalAnswer::Text(c.get(1)?.as_str().trim().to_string()))));
    let var_marker = FINAL_VAR
        .as_ref()
        .and_then(|re| re.captures(&prose))
        .and_then(|c| Some((c.get(0)?.start(), FinalAnswer::Variable(c.get(1)?.as_str().to_string()))));

    match (text_marker, var_marker) {
        (Some(t), Some(v)) => Some(if t.0 <= v.0 { t.1 } else { v.1 }),
        (t, v) => t.or(v).map(|(_, answer)| answer),
    }
}

/// The answer an iteration terminates with, if any.
///
/// `FINAL_VAR` is looked up in the blocks' variable snapshots, last block
/// first; a name bound nowhere does not terminate the loop.
pub fn resolve_final_answer(iteration: &Iteration) -> Option<String> {
    match find_final_answer(&iteration.response)? {
        FinalAnswer::Text(answer) => Some(answer),
        FinalAnswer::Variable(name) => iteration
            .code_blocks
            .iter()
            .rev()
            .find_map(|block| block.result.variables.get(&name))
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    }
}

/// Cap `text` at `max_chars` characters with a visible marker.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... (truncated to {max_chars}/{total} chars)")
}

fn render_result(result: &ExecutionResult, max_chars: usize) -> String {
    let mut out = String::new();
    if !result.stdout.is_empty() {
        out.push_str(&truncate(&result.stdout, max_chars));
    }
    if !result.stderr.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("[stderr]\n");
        out.push_str(&truncate(&result.stderr, max_chars));
    }
    if out.trim().is_empty() {
        return "(no output)".to_string();
    }
    out
}

/// Messages appended to history for a non-terminal iteration: the assistant
/// response, then one user message per executed block.
pub fn format_iteration(iteration: &Iteration, max_output_chars: usize) -> Vec<Message> {
    let mut messages = Vec::with_capacity(1 + iteration.code_blocks.len());
    messages.push(Message::assistant(iteration.response.clone()));
    for block in &iteration.code_blocks {
        messages.push(Message::user(format!(
            "Code executed:\n```repl\n{}\n```\n\nREPL output:\n{}",
            block.code,
            render_result(&block.result, max_output_chars)
        )));
    }
    messages
}
