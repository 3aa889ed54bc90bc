//! Response normalizer: provider text in, sanitized stage output out.
//!
//! Strategies from [`strategy`] are tried in order until one yields an
//! object that [`schema::sanitize`] accepts. Every attempt is recorded with
//! its timing. The raw text is always kept in the outcome.

pub mod schema;
pub mod strategy;

use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::domain::{OutputSchema, Section, StageOutput};
use strategy::{StrategyFn, StrategyName, DEFAULT_STRATEGIES};

/// Audit record for one strategy attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: StrategyName,
    pub succeeded: bool,
    pub elapsed_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of normalizing one provider response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StageOutput>,
    pub warnings: Vec<String>,
    pub raw: String,
    pub attempts: Vec<StrategyAttempt>,
    /// Sections found in the accepted payload.
    pub sections: Vec<Section>,
}

impl NormalizeOutcome {
    /// Strategy that produced `data`, if any.
    pub fn strategy(&self) -> Option<StrategyName> {
        self.attempts
            .iter()
            .find(|a| a.succeeded)
            .map(|a| a.strategy)
    }

    /// One-line reason for a failed outcome.
    pub fn failure_reason(&self) -> String {
        let reasons: Vec<String> = self
            .attempts
            .iter()
            .filter_map(|a| {
                a.error
                    .as_ref()
                    .map(|e| format!("{}: {}", a.strategy.as_str(), e))
            })
            .collect();
        if reasons.is_empty() {
            "no strategy attempted".to_string()
        } else {
            reasons.join("; ")
        }
    }
}

/// Ordered cascade of parse strategies.
#[derive(Clone)]
pub struct Normalizer {
    strategies: Vec<(StrategyName, StrategyFn)>,
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|(name, _)| name))
            .finish()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            strategies: DEFAULT_STRATEGIES.to_vec(),
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A normalizer with a custom strategy order.
    pub fn with_strategies(strategies: Vec<(StrategyName, StrategyFn)>) -> Self {
        Self { strategies }
    }

    pub fn normalize(&self, raw: &str, schema: OutputSchema) -> NormalizeOutcome {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for (name, parse) in &self.strategies {
            let started = Instant::now();
            let result = parse(raw).and_then(|value| schema::sanitize(&value, schema));
            let elapsed_us = started.elapsed().as_micros() as u64;

            match result {
                Ok(sanitized) => {
                    attempts.push(StrategyAttempt {
                        strategy: *name,
                        succeeded: true,
                        elapsed_us,
                        error: None,
                    });
                    debug!(
                        strategy = name.as_str(),
                        warnings = sanitized.warnings.len(),
                        "response normalized"
                    );
                    return NormalizeOutcome {
                        ok: true,
                        data: Some(sanitized.output),
                        warnings: sanitized.warnings,
                        raw: raw.to_string(),
                        attempts,
                        sections: sanitized.sections,
                    };
                }
                Err(error) => attempts.push(StrategyAttempt {
                    strategy: *name,
                    succeeded: false,
                    elapsed_us,
                    error: Some(error),
                }),
            }
        }

        debug!(attempts = attempts.len(), "response could not be normalized");
        NormalizeOutcome {
            ok: false,
            data: None,
            warnings: Vec::new(),
            raw: raw.to_string(),
            attempts,
            sections: Vec::new(),
        }
    }
}
