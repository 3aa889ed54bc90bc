//! Test doubles for the provider boundary and the breaker clock.
//!
//! `ScriptedProvider` replays a per-stage script of responses and records
//! every call; `ManualClock` only moves when told to.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProviderClient, ProviderError};
use crate::breaker::Clock;
use crate::domain::OutputSchema;

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    /// Wait this long before replying.
    pub delay_ms: u64,
    pub result: Result<String, ProviderError>,
}

impl ScriptedReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            result: Ok(body.into()),
        }
    }

    pub fn err(error: ProviderError) -> Self {
        Self {
            delay_ms: 0,
            result: Err(error),
        }
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub stage: String,
    pub provider: String,
    pub payload: serde_json::Value,
}

/// Provider that replays scripted replies per stage.
///
/// When a stage's script runs out, its last reply repeats. Stages without a
/// script get [`canned_response`] for their standard schema.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    last: Mutex<HashMap<String, ScriptedReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append replies to a stage's script.
    pub fn on_stage<I>(self, stage: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage.to_string())
            .or_default()
            .extend(replies);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == stage)
            .count()
    }

    /// Poll until at least `n` calls were made or `timeout` passes.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.call_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.call_count() >= n
    }

    fn next_reply(&self, stage: &str) -> ScriptedReply {
        let mut scripts = self.scripts.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match scripts.get_mut(stage).and_then(VecDeque::pop_front) {
            Some(reply) => {
                last.insert(stage.to_string(), reply.clone());
                reply
            }
            None => last
                .get(stage)
                .cloned()
                .unwrap_or_else(|| ScriptedReply::ok(canned_response(schema_for(stage)))),
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn call(
        &self,
        stage: &str,
        provider: &str,
        payload: &serde_json::Value,
        _timeout_ms: u64,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(RecordedCall {
            stage: stage.to_string(),
            provider: provider.to_string(),
            payload: payload.clone(),
        });
        let reply = self.next_reply(stage);
        if reply.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(reply.delay_ms)).await;
        }
        reply.result
    }
}

fn schema_for(stage: &str) -> OutputSchema {
    match stage {
        crate::domain::SCENE_EXTRACTION => OutputSchema::Extraction,
        crate::domain::INTERPRETATION => OutputSchema::Interpretation,
        crate::domain::SYNTHESIS => OutputSchema::Synthesis,
        _ => OutputSchema::Full,
    }
}

/// A well-formed provider reply for `schema`.
pub fn canned_response(schema: OutputSchema) -> String {
    let annotations = serde_json::json!([
        {"id": "ann-contrast", "type": "issue", "x": 12, "y": 30, "width": 40, "height": 8,
         "title": "Low contrast call to action", "description": "Button text fails contrast checks",
         "severity": "high", "confidence": 0.86},
        {"id": "ann-hero", "type": "success", "x": 0, "y": 0, "width": 100, "height": 35,
         "title": "Clear hero", "description": "Headline is prominent", "severity": "low", "confidence": 0.74}
    ]);
    let suggestions = serde_json::json!([
        {"id": "sug-contrast", "category": "accessibility", "title": "Raise button contrast",
         "description": "Use a darker fill behind the CTA label", "impact": "high", "effort": "low",
         "actionItems": ["Darken the CTA fill", "Re-check WCAG AA"]}
    ]);
    let summary = serde_json::json!({
        "overallScore": 74,
        "categoryScores": {"usability": 78, "accessibility": 61, "visual": 82, "content": 75},
        "keyIssues": ["Call to action contrast"],
        "strengths": ["Clear visual hierarchy"]
    });

    let body = match schema {
        OutputSchema::Extraction => serde_json::json!({ "visualAnnotations": annotations }),
        OutputSchema::Interpretation => serde_json::json!({ "suggestions": suggestions }),
        OutputSchema::Synthesis => serde_json::json!({ "summary": summary }),
        OutputSchema::Full => serde_json::json!({
            "visualAnnotations": annotations,
            "suggestions": suggestions,
            "summary": summary,
        }),
    };
    body.to_string()
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
