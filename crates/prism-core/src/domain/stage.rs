//! Stage definitions, the stage catalog, and per-run stage results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::analysis::StageOutput;
use crate::domain::error::{PrismError, Result};
use crate::domain::failure::{FailureKind, StageFailure};

pub const SCENE_EXTRACTION: &str = "scene_extraction";
pub const INTERPRETATION: &str = "interpretation";
pub const SYNTHESIS: &str = "synthesis";

/// Stage names of the standard pipeline, in order.
pub const STANDARD_STAGES: [&str; 3] = [SCENE_EXTRACTION, INTERPRETATION, SYNTHESIS];

// ---------------------------------------------------------------------------
// Output schema
// ---------------------------------------------------------------------------

/// A top-level section of an analysis body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    VisualAnnotations,
    Suggestions,
    Summary,
}

impl Section {
    pub const ALL: [Section; 3] = [
        Section::VisualAnnotations,
        Section::Suggestions,
        Section::Summary,
    ];

    /// Canonical wire key.
    pub fn key(&self) -> &'static str {
        match self {
            Section::VisualAnnotations => "visualAnnotations",
            Section::Suggestions => "suggestions",
            Section::Summary => "summary",
        }
    }

    /// Keys accepted for this section, canonical key first.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Section::VisualAnnotations => &["visualAnnotations", "visual_annotations", "annotations"],
            Section::Suggestions => &["suggestions", "recommendations"],
            Section::Summary => &["summary"],
        }
    }
}

/// Which sections a stage is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    Extraction,
    Interpretation,
    Synthesis,
    /// A complete analysis body (all sections).
    Full,
}

impl OutputSchema {
    pub fn expected_sections(&self) -> &'static [Section] {
        match self {
            OutputSchema::Extraction => &[Section::VisualAnnotations],
            OutputSchema::Interpretation => &[Section::Suggestions],
            OutputSchema::Synthesis => &[Section::Summary],
            OutputSchema::Full => &Section::ALL,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(OutputSchema::Extraction),
            "interpretation" => Some(OutputSchema::Interpretation),
            "synthesis" => Some(OutputSchema::Synthesis),
            "full" => Some(OutputSchema::Full),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage definitions
// ---------------------------------------------------------------------------

/// Static configuration of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_required")]
    pub required: bool,
    pub schema: OutputSchema,
}

fn default_stage_timeout_ms() -> u64 {
    30_000
}

fn default_required() -> bool {
    true
}

impl StageDefinition {
    /// A required stage with no dependencies and the default timeout.
    pub fn new(name: impl Into<String>, provider: impl Into<String>, schema: OutputSchema) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            depends_on: BTreeSet::new(),
            timeout_ms: default_stage_timeout_ms(),
            required: true,
            schema,
        }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.insert(stage.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Named set of stage definitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageCatalog {
    stages: BTreeMap<String, StageDefinition>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scene extraction (vision) → interpretation → synthesis (reasoning).
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        catalog.insert(StageDefinition::new(
            SCENE_EXTRACTION,
            "vision",
            OutputSchema::Extraction,
        ));
        catalog.insert(
            StageDefinition::new(INTERPRETATION, "reasoning", OutputSchema::Interpretation)
                .depends_on(SCENE_EXTRACTION)
                .timeout_ms(45_000),
        );
        catalog.insert(
            StageDefinition::new(SYNTHESIS, "reasoning", OutputSchema::Synthesis)
                .depends_on(INTERPRETATION)
                .timeout_ms(45_000),
        );
        catalog
    }

    /// Insert or replace a definition.
    pub fn insert(&mut self, definition: StageDefinition) {
        self.stages.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Providers referenced by any stage.
    pub fn providers(&self) -> BTreeSet<&str> {
        self.stages.values().map(|s| s.provider.as_str()).collect()
    }
}

impl FromIterator<StageDefinition> for StageCatalog {
    fn from_iter<I: IntoIterator<Item = StageDefinition>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for def in iter {
            catalog.insert(def);
        }
        catalog
    }
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

/// Lifecycle status of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
    /// Backoff slept before the next attempt, if one followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

/// Outcome of one stage in one run.
///
/// Owned by the run that drives it. Once the status is terminal every
/// mutator returns [`PrismError::StageAlreadyTerminal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub provider: String,
    pub attempt_count: u32,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_output: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(stage: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            provider: provider.into(),
            attempt_count: 0,
            status: StageStatus::Pending,
            raw_response: None,
            normalized_output: None,
            error: None,
            skip_reason: None,
            warnings: Vec::new(),
            attempts: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(PrismError::StageAlreadyTerminal {
                stage: self.stage.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_status(&self, expected: StageStatus, to: StageStatus) -> Result<()> {
        self.ensure_open()?;
        if self.status != expected {
            return Err(PrismError::InvalidTransition {
                stage: self.stage.clone(),
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// `pending → running`.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_status(StageStatus::Pending, StageStatus::Running)?;
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Count a new provider attempt; returns its 1-based number.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        self.ensure_status(StageStatus::Running, StageStatus::Running)?;
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// Record a failed attempt that may still be retried.
    pub fn record_attempt(&mut self, record: AttemptRecord) -> Result<()> {
        self.ensure_status(StageStatus::Running, StageStatus::Running)?;
        self.attempts.push(record);
        Ok(())
    }

    /// `running → succeeded`.
    pub fn succeed(
        &mut self,
        raw_response: String,
        output: StageOutput,
        warnings: Vec<String>,
    ) -> Result<()> {
        self.ensure_status(StageStatus::Running, StageStatus::Succeeded)?;
        self.status = StageStatus::Succeeded;
        self.raw_response = Some(raw_response);
        self.normalized_output = Some(output);
        self.warnings.extend(warnings);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `running → failed`. The raw response of the last attempt is kept
    /// when one exists.
    pub fn fail(&mut self, failure: StageFailure, raw_response: Option<String>) -> Result<()> {
        self.ensure_status(StageStatus::Running, StageStatus::Failed)?;
        self.status = StageStatus::Failed;
        self.error = Some(failure);
        if raw_response.is_some() {
            self.raw_response = raw_response;
        }
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `pending → skipped`.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_status(StageStatus::Pending, StageStatus::Skipped)?;
        self.status = StageStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_shape() {
        let catalog = StageCatalog::standard();
        assert_eq!(catalog.len(), 3);

        let interp = catalog.get(INTERPRETATION).unwrap();
        assert_eq!(interp.provider, "reasoning");
        assert!(interp.depends_on.contains(SCENE_EXTRACTION));
        assert!(interp.required);

        let providers: Vec<&str> = catalog.providers().into_iter().collect();
        assert_eq!(providers, vec!["reasoning", "vision"]);
    }

    #[test]
    fn test_stage_lifecycle() {
        let mut result = StageResult::pending(SCENE_EXTRACTION, "vision");
        result.start().unwrap();
        assert_eq!(result.begin_attempt().unwrap(), 1);
        result
            .record_attempt(AttemptRecord {
                attempt: 1,
                kind: FailureKind::Transient,
                message: "503".to_string(),
                backoff_ms: Some(10),
            })
            .unwrap();
        assert_eq!(result.begin_attempt().unwrap(), 2);
        result
            .succeed("{}".to_string(), StageOutput::default(), vec![])
            .unwrap();

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.retries(), 1);
        assert!(result.started_at.is_some());
        assert!(result.ended_at.is_some());
    }

    #[test]
    fn test_terminal_stage_rejects_mutation() {
        let mut result = StageResult::pending(SYNTHESIS, "reasoning");
        result.skip("dependency `interpretation` did not succeed").unwrap();

        let err = result.start().unwrap_err();
        assert!(matches!(err, PrismError::StageAlreadyTerminal { .. }));
        let err = result
            .fail(StageFailure::cancelled(), None)
            .unwrap_err();
        assert!(matches!(err, PrismError::StageAlreadyTerminal { .. }));
    }

    #[test]
    fn test_skip_requires_pending() {
        let mut result = StageResult::pending(SYNTHESIS, "reasoning");
        result.start().unwrap();
        let err = result.skip("late").unwrap_err();
        assert!(matches!(err, PrismError::InvalidTransition { .. }));
    }

    #[test]
    fn test_schema_expectations() {
        assert_eq!(
            OutputSchema::Extraction.expected_sections(),
            &[Section::VisualAnnotations]
        );
        assert_eq!(OutputSchema::Full.expected_sections().len(), 3);
        assert_eq!(OutputSchema::parse("synthesis"), Some(OutputSchema::Synthesis));
        assert_eq!(OutputSchema::parse("nope"), None);
    }
}
