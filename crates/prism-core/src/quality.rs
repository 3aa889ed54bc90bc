//! Quality score for a pipeline run.
//!
//! `stage_weight * succeeded/total + output_weight * saturation(findings)
//! - min(retries * retry_penalty, max_retry_penalty)`, clamped to [0, 100].
//! Findings are annotations plus suggestions. The score is a pure function
//! of its inputs and is recomputed from scratch on every call.

use serde::{Deserialize, Serialize};

use crate::domain::{NormalizedAnalysis, StageResult, StageStatus};

/// Share of the output term reached exactly at `output_saturation`.
const SATURATION_KNEE: f64 = 0.8;

/// Weights for [`score`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub stage_weight: f64,
    pub output_weight: f64,
    /// Findings count after which more findings add less.
    pub output_saturation: u32,
    pub retry_penalty: f64,
    pub max_retry_penalty: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            stage_weight: 70.0,
            output_weight: 30.0,
            output_saturation: 10,
            retry_penalty: 5.0,
            max_retry_penalty: 20.0,
        }
    }
}

/// Map a findings count into [0, 1): linear up to the knee at
/// `saturation`, then approaching 1 exponentially.
fn saturation(findings: usize, saturation: u32) -> f64 {
    let s = f64::from(saturation.max(1));
    let n = findings as f64;
    if n <= s {
        SATURATION_KNEE * n / s
    } else {
        SATURATION_KNEE + (1.0 - SATURATION_KNEE) * (1.0 - (-(n - s) / s).exp())
    }
}

fn findings_in(results: &[StageResult]) -> usize {
    results
        .iter()
        .filter_map(|r| r.normalized_output.as_ref())
        .map(|o| o.visual_annotations.len() + o.suggestions.len())
        .sum()
}

/// Score a run's stage results and (if synthesized) its analysis.
///
/// Without an analysis the findings are counted from the stage outputs.
pub fn score(
    weights: &QualityWeights,
    results: &[StageResult],
    analysis: Option<&NormalizedAnalysis>,
) -> u8 {
    let total = results.len();
    let succeeded = results
        .iter()
        .filter(|r| r.status == StageStatus::Succeeded)
        .count();
    let stage_fraction = if total == 0 {
        0.0
    } else {
        succeeded as f64 / total as f64
    };

    let findings = analysis
        .map(NormalizedAnalysis::finding_count)
        .unwrap_or_else(|| findings_in(results));

    let retries: u32 = results.iter().map(StageResult::retries).sum();
    let penalty = (f64::from(retries) * weights.retry_penalty).min(weights.max_retry_penalty);

    let raw = weights.stage_weight * stage_fraction
        + weights.output_weight * saturation(findings, weights.output_saturation)
        - penalty;

    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, StageFailure, StageOutput, Suggestion};

    fn succeeded(stage: &str, suggestions: usize, attempts: u32) -> StageResult {
        let mut r = StageResult::pending(stage, "p");
        r.start().unwrap();
        for _ in 0..attempts {
            r.begin_attempt().unwrap();
        }
        let output = StageOutput {
            suggestions: (0..suggestions)
                .map(|i| Suggestion {
                    id: format!("suggestion-{i}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        r.succeed("{}".into(), output, vec![]).unwrap();
        r
    }

    fn failed(stage: &str) -> StageResult {
        let mut r = StageResult::pending(stage, "p");
        r.start().unwrap();
        r.begin_attempt().unwrap();
        r.fail(StageFailure::new(FailureKind::Permanent, "400"), None)
            .unwrap();
        r
    }

    #[test]
    fn test_saturation_is_monotonic_and_bounded() {
        let mut last = -1.0;
        for n in 0..200 {
            let s = saturation(n, 10);
            assert!(s >= last);
            assert!((0.0..1.0).contains(&s));
            last = s;
        }
        assert!((saturation(10, 10) - SATURATION_KNEE).abs() < 1e-9);
    }

    #[test]
    fn test_all_success_scores_high() {
        let w = QualityWeights::default();
        let results = vec![succeeded("a", 5, 1), succeeded("b", 5, 1)];
        // 70 + 30 * 0.8
        assert_eq!(score(&w, &results, None), 94);
    }

    #[test]
    fn test_retries_are_penalized_and_capped() {
        let w = QualityWeights::default();
        let clean = score(&w, &[succeeded("a", 10, 1)], None);
        let one_retry = score(&w, &[succeeded("a", 10, 2)], None);
        let many = score(&w, &[succeeded("a", 10, 20)], None);
        assert_eq!(clean - one_retry, 5);
        assert_eq!(clean - many, 20);
    }

    #[test]
    fn test_failures_lower_the_score() {
        let w = QualityWeights::default();
        let results = vec![succeeded("a", 0, 1), failed("b")];
        assert_eq!(score(&w, &results, None), 35);
        assert_eq!(score(&w, &[failed("a")], None), 0);
        assert_eq!(score(&w, &[], None), 0);
    }

    #[test]
    fn test_deterministic_and_in_range() {
        let w = QualityWeights {
            stage_weight: 500.0,
            ..Default::default()
        };
        let results = vec![succeeded("a", 50, 1)];
        let first = score(&w, &results, None);
        assert_eq!(first, 100);
        assert_eq!(first, score(&w, &results, None));

        let negative = QualityWeights {
            stage_weight: 0.0,
            output_weight: 0.0,
            ..Default::default()
        };
        assert_eq!(score(&negative, &[succeeded("a", 0, 4)], None), 0);
    }
}
