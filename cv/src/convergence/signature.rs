//! Failure signatures for stuck detection
//!
//! Two errors share a signature when they differ only in whitespace or
//! numbers (line numbers, counts, addresses).

use std::sync::LazyLock;

use regex::Regex;

use crate::gate::GateType;

const MAX_SIGNATURE_LEN: usize = 160;

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid digits regex"));

/// `gate_type:normalized error`
pub fn failure_signature(gate_type: GateType, error: &str) -> String {
    let collapsed = error.split_whitespace().collect::<Vec<_>>().join(" ");
    let masked = DIGITS_RE.replace_all(&collapsed, "N");
    let truncated: String = masked.chars().take(MAX_SIGNATURE_LEN).collect();
    format!("{}:{}", gate_type, truncated)
}
