/// Variable catalog: the set of metric names the remote service accepts.
///
/// Loaded once per pipeline run and treated as read-only reference data
/// for the run's lifetime. There is deliberately no process-global
/// cache, so a fresh run always revalidates against a fresh catalog.
/// Validation is a pure lookup and happens strictly before any metric
/// fetch is attempted.

use std::collections::HashMap;

use crate::ingest::retry::RetryPolicy;
use crate::model::{PipelineError, VariableSpec};

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// Where the catalog comes from. The production implementation is
/// `ingest::streamcat::StreamCatClient`; tests script their own.
pub trait VariableSource {
    fn fetch_variables(&self) -> Result<Vec<VariableSpec>, PipelineError>;
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct VariableCatalog {
    specs: Vec<VariableSpec>,
    by_short_name: HashMap<String, usize>,
}

impl VariableCatalog {
    /// Fetches the catalog through `source`, retrying transient failures.
    /// Exhaustion is fatal for the run: nothing can be validated without
    /// a catalog.
    pub fn load(
        source: &dyn VariableSource,
        retry: &RetryPolicy,
    ) -> Result<Self, PipelineError> {
        let specs = retry
            .run(|| source.fetch_variables())
            .map_err(|e| PipelineError::CatalogUnavailable(e.to_string()))?;
        Ok(Self::from_specs(specs))
    }

    /// Builds a catalog from already-fetched specs (checkpoint restore
    /// and tests).
    pub fn from_specs(specs: Vec<VariableSpec>) -> Self {
        let mut by_short_name = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            by_short_name.insert(spec.short_name.to_lowercase(), i);
        }
        VariableCatalog { specs, by_short_name }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[VariableSpec] {
        &self.specs
    }

    /// Case-insensitive membership test.
    pub fn contains(&self, short_name: &str) -> bool {
        self.by_short_name.contains_key(&short_name.to_lowercase())
    }

    /// Returns the requested names that are not in the catalog, in
    /// request order, deduplicated. Empty means the list is safe to
    /// fetch. Pure computation, no network cost.
    pub fn validate(&self, requested: &[String]) -> Vec<String> {
        let mut invalid = Vec::new();
        for name in requested {
            if !self.contains(name) && !invalid.iter().any(|seen| seen == name) {
                invalid.push(name.clone());
            }
        }
        invalid
    }

    /// Full descriptive name for a metric.
    pub fn full_name(&self, short_name: &str) -> Result<&str, PipelineError> {
        self.by_short_name
            .get(&short_name.to_lowercase())
            .map(|&i| self.specs[i].full_name.as_str())
            .ok_or_else(|| PipelineError::UnknownVariable(short_name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
