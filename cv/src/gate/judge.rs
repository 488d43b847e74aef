//! TieredJudge - cheapest sufficient judgment for semantic gates
//!
//! Tier 1 runs structural checks. A hard failure there is a confident reject
//! and nothing else is consulted. Tier 2 asks a lightweight classifier; its
//! answer is final only when it is confident and clearly on one side of the
//! auto thresholds. Everything else goes to the tier 3 arbiter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::structural::{self, StructuralReport};
use crate::oracle::{FileSnapshot, GenerateOptions, Oracle, OracleError, PromptLibrary, TemplateName, extract_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// Which tier produced the final verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeTier {
    Structural,
    Classifier,
    Arbiter,
}

impl std::fmt::Display for JudgeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structural => write!(f, "structural"),
            Self::Classifier => write!(f, "classifier"),
            Self::Arbiter => write!(f, "arbiter"),
        }
    }
}

/// What a judge is asked to evaluate
#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest {
    pub contract: String,
    pub files: Vec<FileSnapshot>,
    /// Issues already found by cheaper tiers
    pub issues: Vec<String>,
}

/// A single judge's opinion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Verdict,
    /// Quality, 0-10
    pub score: f32,
    /// Self-reported confidence, 0-1
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Judgment {
    /// Stand-in for an answer that could not be understood
    pub fn unconfident(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            score: 0.0,
            confidence: 0.0,
            issues: vec![reason.into()],
        }
    }

    fn clamped(mut self) -> Self {
        self.score = self.score.clamp(0.0, 10.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Classifier or arbiter
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, OracleError>;
}

/// Judge backed by the Oracle with a fixed model hint
pub struct OracleJudge {
    oracle: Arc<dyn Oracle>,
    options: GenerateOptions,
    prompts: Arc<PromptLibrary>,
}

impl OracleJudge {
    pub fn new(oracle: Arc<dyn Oracle>, options: GenerateOptions, prompts: Arc<PromptLibrary>) -> Self {
        Self {
            oracle,
            options,
            prompts,
        }
    }
}

#[async_trait]
impl Judge for OracleJudge {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, OracleError> {
        let prompt = self.prompts.render(TemplateName::Judge, request)?;
        let generation = self.oracle.generate(&prompt, &self.options).await?;

        let parsed = extract_json(&generation.content).and_then(|json| serde_json::from_str::<Judgment>(json).ok());
        Ok(match parsed {
            Some(judgment) => judgment.clamped(),
            None => {
                debug!("OracleJudge::judge: unparsable reply, treating as unconfident");
                Judgment::unconfident("judge reply was not understood")
            }
        })
    }
}

/// Thresholds for the tiered judgment, on the 0-10 score scale
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Classifier answers with at least this confidence may be final
    #[serde(rename = "confidence-threshold")]
    pub confidence_threshold: f32,

    /// Minimum score for a pass, whatever the verdict
    #[serde(rename = "purity-threshold")]
    pub purity_threshold: f32,

    /// Classifier score at or above which a confident approve is final
    #[serde(rename = "auto-approve")]
    pub auto_approve: f32,

    /// Classifier score at or below which a confident reject is final
    #[serde(rename = "auto-reject")]
    pub auto_reject: f32,

    /// Subtracted from the score per soft structural issue
    #[serde(rename = "soft-issue-penalty")]
    pub soft_issue_penalty: f32,

    /// Model hint for tier 2
    #[serde(rename = "classifier-model")]
    pub classifier_model: Option<String>,

    /// Model hint for tier 3
    #[serde(rename = "arbiter-model")]
    pub arbiter_model: Option<String>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            purity_threshold: 6.0,
            auto_approve: 8.0,
            auto_reject: 4.0,
            soft_issue_penalty: 1.0,
            classifier_model: None,
            arbiter_model: None,
        }
    }
}

/// Final outcome of the tiered judgment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredVerdict {
    pub passed: bool,
    pub verdict: Verdict,
    pub score: f32,
    pub confidence: f32,
    pub tier: JudgeTier,
    pub issues: Vec<String>,
}

/// Structural -> classifier -> arbiter
pub struct TieredJudge {
    config: JudgeConfig,
    classifier: Arc<dyn Judge>,
    arbiter: Arc<dyn Judge>,
}

impl TieredJudge {
    pub fn new(config: JudgeConfig, classifier: Arc<dyn Judge>, arbiter: Arc<dyn Judge>) -> Self {
        Self {
            config,
            classifier,
            arbiter,
        }
    }

    /// Classifier and arbiter both backed by the Oracle, with the configured model hints
    pub fn from_oracle(config: JudgeConfig, oracle: Arc<dyn Oracle>, prompts: Arc<PromptLibrary>) -> Self {
        let options_for = |model: &Option<String>| GenerateOptions {
            model: model.clone(),
            ..Default::default()
        };
        let classifier = Arc::new(OracleJudge::new(
            oracle.clone(),
            options_for(&config.classifier_model),
            prompts.clone(),
        ));
        let arbiter = Arc::new(OracleJudge::new(oracle, options_for(&config.arbiter_model), prompts));
        Self::new(config, classifier, arbiter)
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    /// Judge files against a contract
    ///
    /// Errors only when the arbiter itself fails; a failing classifier just
    /// escalates.
    pub async fn evaluate(&self, contract: &str, files: &[FileSnapshot]) -> Result<TieredVerdict, OracleError> {
        debug!(files = files.len(), "TieredJudge::evaluate: called");

        // Tier 1
        let report = structural::check_files(files);
        if !report.passed() {
            info!(issues = report.hard.len(), "TieredJudge: structural reject");
            let mut issues = report.hard;
            issues.extend(report.soft);
            return Ok(TieredVerdict {
                passed: false,
                verdict: Verdict::Reject,
                score: 0.0,
                confidence: 1.0,
                tier: JudgeTier::Structural,
                issues,
            });
        }

        let request = JudgeRequest {
            contract: contract.to_string(),
            files: files.to_vec(),
            issues: report.soft.clone(),
        };

        // Tier 2
        match self.classifier.judge(&request).await {
            Ok(judgment) => {
                let score = self.penalized(judgment.score, &report);
                let decisive = score >= self.config.auto_approve || score <= self.config.auto_reject;
                if judgment.confidence >= self.config.confidence_threshold && decisive {
                    debug!(score, confidence = judgment.confidence, "TieredJudge: classifier decided");
                    return Ok(self.finish(judgment, score, JudgeTier::Classifier, &report));
                }
                debug!(
                    score,
                    confidence = judgment.confidence,
                    "TieredJudge: classifier uncertain, escalating"
                );
            }
            Err(e) => warn!(error = %e, "TieredJudge: classifier failed, escalating"),
        }

        // Tier 3
        let judgment = self.arbiter.judge(&request).await?;
        let score = self.penalized(judgment.score, &report);
        Ok(self.finish(judgment, score, JudgeTier::Arbiter, &report))
    }

    fn penalized(&self, score: f32, report: &StructuralReport) -> f32 {
        (score - report.soft.len() as f32 * self.config.soft_issue_penalty).max(0.0)
    }

    fn finish(&self, judgment: Judgment, score: f32, tier: JudgeTier, report: &StructuralReport) -> TieredVerdict {
        let passed = judgment.verdict == Verdict::Approve && score >= self.config.purity_threshold;
        let mut issues = report.soft.clone();
        issues.extend(judgment.issues);
        TieredVerdict {
            passed,
            verdict: judgment.verdict,
            score,
            confidence: judgment.confidence,
            tier,
            issues,
        }
    }
}
