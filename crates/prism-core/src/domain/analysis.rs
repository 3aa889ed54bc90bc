//! Analysis bodies: per-stage outputs and the final normalized analysis.
//!
//! Every type here serializes camelCase; that is the stable wire shape
//! consumed by clients.

use serde::{Deserialize, Serialize};

/// How the final analysis was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    Full,
    Partial,
    Degraded,
}

impl RecoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryMode::Full => "full",
            RecoveryMode::Partial => "partial",
            RecoveryMode::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Issue,
    Suggestion,
    Success,
    #[default]
    Info,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionCategory {
    Usability,
    Accessibility,
    Visual,
    Content,
    #[default]
    Other,
}

/// Impact and effort share one low/medium/high scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
}

/// A region of the image with an observation attached.
///
/// Coordinates are percentages of the image size, in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualAnnotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    /// In `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: String,
    pub category: SuggestionCategory,
    pub title: String,
    pub description: String,
    pub impact: Level,
    pub effort: Level,
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub usability: u8,
    pub accessibility: u8,
    pub visual: u8,
    pub content: u8,
}

impl CategoryScores {
    pub fn uniform(score: u8) -> Self {
        Self {
            usability: score,
            accessibility: score,
            visual: score,
            content: score,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub overall_score: u8,
    pub category_scores: CategoryScores,
    pub key_issues: Vec<String>,
    pub strengths: Vec<String>,
}

/// Sanitized output of a single stage.
///
/// `summary` stays `None` when the stage did not produce one, so the
/// synthesizer can tell a real summary from a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    pub visual_annotations: Vec<VisualAnnotation>,
    pub suggestions: Vec<Suggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_mode: Option<RecoveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_stages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_stages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Final analysis body. Same shape for full, partial and degraded runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedAnalysis {
    pub visual_annotations: Vec<VisualAnnotation>,
    pub suggestions: Vec<Suggestion>,
    pub summary: Summary,
    #[serde(default)]
    pub metadata: AnalysisMetadata,
}

impl NormalizedAnalysis {
    /// Merge stage outputs in order. Annotations and suggestions are
    /// concatenated; the last stage that produced a summary wins.
    ///
    /// Returns the analysis plus whether any stage supplied a summary.
    pub fn merge<'a, I>(outputs: I) -> (Self, bool)
    where
        I: IntoIterator<Item = &'a StageOutput>,
    {
        let mut merged = NormalizedAnalysis::default();
        let mut summary = None;
        for output in outputs {
            merged
                .visual_annotations
                .extend(output.visual_annotations.iter().cloned());
            merged.suggestions.extend(output.suggestions.iter().cloned());
            if let Some(s) = &output.summary {
                summary = Some(s.clone());
            }
        }
        let has_summary = summary.is_some();
        merged.summary = summary.unwrap_or_default();
        (merged, has_summary)
    }

    /// Number of annotations plus suggestions.
    pub fn finding_count(&self) -> usize {
        self.visual_annotations.len() + self.suggestions.len()
    }
}
