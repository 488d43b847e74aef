//! Structural checks - cheap, deterministic, no model involved
//!
//! Hard issues make the content unusable (empty file, unbalanced delimiters,
//! leftover merge-conflict markers). Soft issues lower the judged quality but
//! do not fail on their own (placeholders, stubbed bodies).

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::oracle::FileSnapshot;

static CONFLICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(<{7} |={7}$|>{7} )").expect("valid conflict regex"));

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(TODO|FIXME|XXX)\b|unimplemented!\(|todo!\(|raise NotImplementedError|\.\.\.\s*#\s*placeholder")
        .expect("valid placeholder regex")
});

/// Extensions whose delimiters must balance
const BRACKETED: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h", "cc", "cpp", "hpp", "cs", "swift", "json", "rb",
    "php", "scala",
];

/// Extensions where `#` starts a line comment
const HASH_COMMENTS: &[&str] = &["py", "rb", "sh"];

/// Findings for a set of files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralReport {
    pub hard: Vec<String>,
    pub soft: Vec<String>,
}

impl StructuralReport {
    /// No hard issue
    pub fn passed(&self) -> bool {
        self.hard.is_empty()
    }
}

/// Run every structural check over every file
pub fn check_files(files: &[FileSnapshot]) -> StructuralReport {
    let mut report = StructuralReport::default();
    if files.is_empty() {
        report.hard.push("no files to validate".to_string());
        return report;
    }
    for file in files {
        check_file(&file.path, &file.content, &mut report);
    }
    report
}

fn check_file(path: &Path, content: &str, report: &mut StructuralReport) {
    let name = path.display();

    if content.trim().is_empty() {
        report.hard.push(format!("{}: file is empty", name));
        return;
    }

    if let Some(m) = CONFLICT_RE.find(content) {
        let line = line_of(content, m.start());
        report.hard.push(format!("{}:{}: merge conflict marker", name, line));
    }

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if BRACKETED.contains(&ext)
        && let Err(msg) = check_delimiters(content, ext)
    {
        report.hard.push(format!("{}: {}", name, msg));
    }

    for m in PLACEHOLDER_RE.find_iter(content) {
        let line = line_of(content, m.start());
        report.soft.push(format!("{}:{}: placeholder `{}`", name, line, m.as_str().trim()));
    }
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

/// Bracket balance, ignoring string literals and comments
fn check_delimiters(content: &str, ext: &str) -> Result<(), String> {
    let hash_comments = HASH_COMMENTS.contains(&ext);
    let single_quote_strings = ext != "rs";
    let chars: Vec<char> = content.chars().collect();

    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if next == Some('/') => {
                i = skip_line(&chars, i);
                continue;
            }
            '#' if hash_comments => {
                i = skip_line(&chars, i);
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
                continue;
            }
            '"' | '`' => {
                i = skip_string(&chars, i, c, &mut line);
                continue;
            }
            '\'' => {
                if let Some(end) = char_literal_end(&chars, i) {
                    i = end;
                    continue;
                }
                if single_quote_strings {
                    i = skip_string(&chars, i, c, &mut line);
                    continue;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "line {}: `{}` closes `{}` opened on line {}",
                            line, c, open, open_line
                        ));
                    }
                    None => return Err(format!("line {}: unmatched `{}`", line, c)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.last() {
        Some((open, open_line)) => Err(format!("unclosed `{}` opened on line {}", open, open_line)),
        None => Ok(()),
    }
}

fn skip_line(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

/// Index just past the closing quote
fn skip_string(chars: &[char], start: usize, quote: char, line: &mut usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '\n' => *line += 1,
            c if c == quote => return i + 1,
            _ => {}
        }
        i += 1;
    }
    i
}

/// `'x'` or `'\n'` style literal starting at `start`
fn char_literal_end(chars: &[char], start: usize) -> Option<usize> {
    match (chars.get(start + 1), chars.get(start + 2), chars.get(start + 3)) {
        (Some('\\'), Some(_), Some('\'')) => Some(start + 4),
        (Some(c), Some('\''), _) if *c != '\\' && *c != '\'' => Some(start + 3),
        _ => None,
    }
}
