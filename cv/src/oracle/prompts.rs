//! Prompt templates
//!
//! Templates are Handlebars. Each has an embedded default; a file named
//! `{name}.hbs` in the override directory replaces it.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::OracleError;

/// The prompts the execution core sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateName {
    Discover,
    Generate,
    Fix,
    Judge,
}

impl TemplateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Generate => "generate",
            Self::Fix => "fix",
            Self::Judge => "judge",
        }
    }

    fn embedded(&self) -> &'static str {
        match self {
            Self::Discover => DISCOVER,
            Self::Generate => GENERATE,
            Self::Fix => FIX,
            Self::Judge => JUDGE,
        }
    }

    const ALL: [TemplateName; 4] = [Self::Discover, Self::Generate, Self::Fix, Self::Judge];
}

/// Compiled prompt templates
pub struct PromptLibrary {
    hbs: Handlebars<'static>,
}

impl PromptLibrary {
    /// Embedded templates only
    pub fn embedded() -> Self {
        Self::load(None)
    }

    /// Embedded templates, each replaced by `{dir}/{name}.hbs` when present
    pub fn load(override_dir: Option<&Path>) -> Self {
        let mut hbs = Handlebars::new();
        // Prompts carry source code; HTML escaping would corrupt it
        hbs.register_escape_fn(handlebars::no_escape);

        for name in TemplateName::ALL {
            let custom = override_dir
                .map(|d| d.join(format!("{}.hbs", name.as_str())))
                .filter(|p| p.exists())
                .and_then(|p| read_override(&p));

            let source = custom.unwrap_or_else(|| name.embedded().to_string());
            if let Err(e) = hbs.register_template_string(name.as_str(), &source) {
                tracing::warn!(template = name.as_str(), error = %e, "Invalid prompt override, using embedded");
                let _ = hbs.register_template_string(name.as_str(), name.embedded());
            }
        }
        Self { hbs }
    }

    pub fn render<T: Serialize>(&self, name: TemplateName, context: &T) -> Result<String, OracleError> {
        debug!(template = name.as_str(), "PromptLibrary::render: called");
        self.hbs
            .render(name.as_str(), context)
            .map_err(|e| OracleError::Template(format!("{}: {}", name.as_str(), e)))
    }
}

fn read_override(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(path = %path.display(), "Loaded prompt override");
            Some(content)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read prompt override");
            None
        }
    }
}

const DISCOVER: &str = r#"You are planning the artifacts needed to accomplish a software goal.

Goal: {{goal}}
{{#if context}}
Context:
{{context}}
{{/if}}
Return ONLY a JSON array. Each element describes one artifact:
  {"id": "short-kebab-id", "description": "what it is", "contract": "what it must satisfy",
   "produces": "relative/path/to/file", "requires": ["ids of artifacts it depends on"],
   "mode": "generate" | "composite" | "verify"}

Rules:
- Dependencies must form a directed acyclic graph.
- Use at most {{max_artifacts}} artifacts.
- Every id in "requires" must be defined in the array.
{{#if hint}}

Your previous answer was rejected: {{hint}}
{{/if}}"#;

const GENERATE: &str = r#"Write the complete contents of `{{target}}`.

Artifact: {{description}}
{{#if contract}}
Contract:
{{contract}}
{{/if}}
{{#each dependencies}}
--- {{this.path}} ---
{{this.content}}
{{/each}}
Output only the file contents in a single fenced code block."#;

const FIX: &str = r#"The following files fail validation (iteration {{iteration}}).
{{#if contract}}
Contract:
{{contract}}
{{/if}}
{{#each failures}}
[{{this.gate_type}}] {{this.gate_id}}:
{{#each this.errors}}
  - {{this}}
{{/each}}
{{/each}}

{{#each files}}
--- {{this.path}} ---
{{this.content}}
{{/each}}
Return ONLY JSON of the form {"edits": [{"path": "...", "content": "full new file contents"}]}."#;

const JUDGE: &str = r#"Review the following artifact against its contract.
{{#if contract}}
Contract:
{{contract}}
{{/if}}
{{#each files}}
--- {{this.path}} ---
{{this.content}}
{{/each}}
{{#if issues}}
Known issues:
{{#each issues}}
  - {{this}}
{{/each}}
{{/if}}
Answer ONLY with JSON: {"verdict": "approve" | "reject", "score": 0-10, "confidence": 0.0-1.0, "issues": ["..."]}"#;
