//! Parsing helpers for Oracle replies

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{FileEdit, FileSnapshot, OracleError, Patch};

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+\-.]*[ \t]*\r?\n(.*?)\r?\n?```").expect("valid fence regex"));

/// Body of the first fenced code block, or the trimmed text when there is none
pub fn strip_code_fence(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().to_string(),
        None => text.trim().to_string(),
    }
}

/// First JSON object or array embedded in `text`
///
/// Tolerates prose before and after the payload and markdown fences around it.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let open = text[start..].chars().next()?;
    let close = if open == '[' { ']' } else { '}' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct PatchReply {
    #[serde(default)]
    edits: Vec<FileEdit>,
}

/// Interpret a repair reply as a [`Patch`]
///
/// Accepts `{"edits": [{"path", "content"}]}`, a bare array of edits, or, when
/// exactly one file was offered for repair, a fenced code block replacing it.
pub fn parse_patch(text: &str, files: &[FileSnapshot]) -> Result<Patch, OracleError> {
    if let Some(json) = extract_json(text) {
        if let Ok(reply) = serde_json::from_str::<PatchReply>(json) {
            return Ok(Patch {
                edits: reply.edits,
                ..Default::default()
            });
        }
        if let Ok(edits) = serde_json::from_str::<Vec<FileEdit>>(json) {
            return Ok(Patch {
                edits,
                ..Default::default()
            });
        }
    }

    if let [only] = files
        && FENCE_RE.is_match(text)
    {
        return Ok(Patch {
            edits: vec![FileEdit {
                path: only.path.clone(),
                content: strip_code_fence(text),
            }],
            ..Default::default()
        });
    }

    if text.trim().is_empty() {
        return Ok(Patch::default());
    }
    Err(OracleError::InvalidResponse(format!(
        "expected a patch, got: {}",
        text.chars().take(120).collect::<String>()
    )))
}
