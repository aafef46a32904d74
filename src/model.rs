/// Core data types for the site enrichment pipeline.
///
/// This module defines the shared domain model imported by all other modules.
/// It contains no logic and no I/O, only types and their conversions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Coordinate reference systems
// ---------------------------------------------------------------------------

/// EPSG code for WGS84 geographic coordinates. Input site tables are
/// expected in this CRS unless the configuration says otherwise.
pub const CRS_WGS84: &str = "EPSG:4326";

// ---------------------------------------------------------------------------
// Aggregation scope
// ---------------------------------------------------------------------------

/// Area-of-interest selector for metric aggregation.
///
/// `Catchment` is the immediate land area draining directly into a stream
/// segment; `Watershed` is the full upstream hydrologically connected area.
/// The metric service tags returned column names with the scope suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aoi {
    Catchment,
    Watershed,
}

impl Aoi {
    /// Column suffix used by the metric service ("CAT" / "WS").
    pub fn column_suffix(self) -> &'static str {
        match self {
            Aoi::Catchment => "CAT",
            Aoi::Watershed => "WS",
        }
    }

    /// Value accepted by the metric service's areaOfInterest parameter.
    pub fn query_value(self) -> &'static str {
        match self {
            Aoi::Catchment => "catchment",
            Aoi::Watershed => "watershed",
        }
    }
}

impl std::str::FromStr for Aoi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "catchment" | "cat" => Ok(Aoi::Catchment),
            "watershed" | "ws" => Ok(Aoi::Watershed),
            other => Err(format!("unknown aggregation scope '{}'", other)),
        }
    }
}

impl fmt::Display for Aoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.query_value())
    }
}

// ---------------------------------------------------------------------------
// Site types
// ---------------------------------------------------------------------------

/// A single monitoring site from the input table.
///
/// One per input row, immutable once loaded. Coordinates are decimal
/// degrees in the configured CRS (WGS84 by default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// The durable association between a site and its catchment.
///
/// `comid` is `None` while the site is unresolved: either never looked
/// up, or the lookup exhausted its retries. Unresolved links are retried
/// on the next run; resolved links are skipped unless a re-resolution is
/// forced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchmentLink {
    pub site_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub comid: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CatchmentLink {
    pub fn resolved(site: &Site, comid: String, at: DateTime<Utc>) -> Self {
        CatchmentLink {
            site_id: site.site_id.clone(),
            longitude: site.longitude,
            latitude: site.latitude,
            comid: Some(comid),
            resolved_at: Some(at),
        }
    }

    pub fn unresolved(site: &Site) -> Self {
        CatchmentLink {
            site_id: site.site_id.clone(),
            longitude: site.longitude,
            latitude: site.latitude,
            comid: None,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.comid.is_some()
    }
}

// ---------------------------------------------------------------------------
// Catalog and metric types
// ---------------------------------------------------------------------------

/// One entry from the remote variable catalog.
///
/// `short_name` is the lowercase metric identifier accepted by the metric
/// service (e.g. "pctdecid2019"); `full_name` is the human-readable
/// description shown in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub short_name: String,
    pub full_name: String,
}

/// Naming convention for metric columns in the enriched output.
///
/// The metric service returns uppercase, scope-suffixed column names
/// (e.g. "PCTDECID2019WS"). Downstream code picks one convention here
/// and never depends on the remote casing directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    /// Keep the service's convention: "PCTDECID2019WS".
    Remote,
    /// Lowercase short name with scope suffix: "pctdecid2019_ws".
    ScopedSnake,
}

/// Metric values for one catchment, keyed by output column name.
///
/// Column names have already been remapped to the configured
/// `ColumnNaming`; a `None` value means the service returned null or the
/// fetch for this catchment failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub comid: String,
    pub aoi: Aoi,
    pub values: BTreeMap<String, Option<f64>>,
}

/// Final output row: one per input site.
///
/// Sites whose catchment failed to resolve keep their row with null
/// metric values; they are never dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedSite {
    pub site_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub comid: Option<String>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl EnrichedSite {
    /// Looks up a metric or derived column by output name.
    pub fn metric(&self, column: &str) -> Option<f64> {
        self.metrics.get(column).copied().flatten()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise while resolving sites or fetching metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The variable catalog could not be fetched after retries.
    CatalogUnavailable(String),
    /// A variable name was looked up that is not in the catalog.
    UnknownVariable(String),
    /// One or more requested variables failed validation. Callers must
    /// fix the list before any metric fetch is attempted.
    InvalidVariableSet(Vec<String>),
    /// The coordinate service returned a different number of identifiers
    /// than coordinate pairs sent. Positional pairing would be wrong, so
    /// the whole batch is rejected.
    ResolutionCountMismatch { expected: usize, got: usize },
    /// Non-2xx HTTP response from a remote service.
    HttpStatus(u16),
    /// The request could not be sent or the response body not read.
    Transport(String),
    /// The response body could not be parsed.
    Parse(String),
    /// The durable link store could not be read or written.
    Store(String),
    /// The run was cancelled between batches.
    Cancelled,
}

impl PipelineError {
    /// Whether retrying the same call may succeed. Server-side errors,
    /// transport failures, and malformed or partial responses are
    /// treated as transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::HttpStatus(code) => *code == 429 || (500..=599).contains(code),
            PipelineError::Transport(_) => true,
            PipelineError::Parse(_) => true,
            PipelineError::ResolutionCountMismatch { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::CatalogUnavailable(msg) => {
                write!(f, "variable catalog unavailable: {}", msg)
            }
            PipelineError::UnknownVariable(name) => write!(f, "unknown variable: {}", name),
            PipelineError::InvalidVariableSet(names) => {
                write!(f, "invalid variables: {}", names.join(", "))
            }
            PipelineError::ResolutionCountMismatch { expected, got } => write!(
                f,
                "resolution count mismatch: sent {} points, got {} identifiers",
                expected, got
            ),
            PipelineError::HttpStatus(code) => write!(f, "HTTP error: {}", code),
            PipelineError::Transport(msg) => write!(f, "transport error: {}", msg),
            PipelineError::Parse(msg) => write!(f, "parse error: {}", msg),
            PipelineError::Store(msg) => write!(f, "store error: {}", msg),
            PipelineError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag checked between remote batches. An in-flight request is
/// allowed to complete or time out before cancellation takes effect.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
