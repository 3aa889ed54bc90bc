//! Execution plan: the requested stages in dependency order.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{AnalysisRequest, PrismError, Result, StageCatalog, StageDefinition};

/// A validated, topologically ordered set of stages for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Dependencies first; ties keep request order.
    order: Vec<StageDefinition>,
    /// Requested dependencies per stage.
    deps: BTreeMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Resolve every requested stage against the catalog and order them.
    ///
    /// Dependencies on stages that were not requested are dropped. Unknown
    /// stages and cycles are [`PrismError::InvalidPlan`].
    pub fn build(request: &AnalysisRequest, catalog: &StageCatalog) -> Result<Self> {
        let requested = request.requested_stages();
        let mut defs = Vec::with_capacity(requested.len());
        for name in requested {
            let def = catalog
                .get(name)
                .ok_or_else(|| PrismError::InvalidPlan(format!("unknown stage `{name}`")))?;
            defs.push(def.clone());
        }

        let deps: BTreeMap<String, Vec<String>> = defs
            .iter()
            .map(|def| {
                let kept = def
                    .depends_on
                    .iter()
                    .filter(|d| request.requests_stage(d))
                    .cloned()
                    .collect();
                (def.name.clone(), kept)
            })
            .collect();

        // Kahn's algorithm, scanning in request order for stable ties.
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut order = Vec::with_capacity(defs.len());
        while order.len() < defs.len() {
            let next = defs.iter().find(|def| {
                !placed.contains(&def.name)
                    && deps
                        .get(&def.name)
                        .map(|ds| ds.iter().all(|d| placed.contains(d)))
                        .unwrap_or(true)
            });
            match next {
                Some(def) => {
                    placed.insert(def.name.clone());
                    order.push(def.clone());
                }
                None => {
                    let stuck: Vec<&str> = defs
                        .iter()
                        .filter(|d| !placed.contains(&d.name))
                        .map(|d| d.name.as_str())
                        .collect();
                    return Err(PrismError::InvalidPlan(format!(
                        "dependency cycle among stages: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(Self { order, deps })
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.order
    }

    /// Requested dependencies of `stage`.
    pub fn deps(&self, stage: &str) -> &[String] {
        self.deps.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
