/// Pipeline orchestration: Validating -> Resolving -> Fetching ->
/// Composing -> Done, with Failed reachable from validation or a fatal
/// remote condition.
///
/// Every completed stage leaves a durable artifact under the checkpoint
/// directory (catalog snapshot, link store, fetched metrics, enriched
/// table) plus a manifest marker, so a restarted run resumes at the
/// first incomplete stage. A manifest left at Done or Failed means the
/// previous run finished; the next invocation starts fresh and
/// invalidates the cached catalog.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{VariableCatalog, VariableSource};
use crate::compose::{compose, DeriveRule};
use crate::config::ServiceConfig;
use crate::fetch::{merge_onto_sites, MetricFetcher, MetricSource};
use crate::logging::{self, DataSource};
use crate::model::{
    Aoi, CancelFlag, EnrichedSite, MetricRow, PipelineError, Site, VariableSpec,
};
use crate::resolve::{ComidLookup, Resolver};
use crate::store::LinkStore;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validating,
    Resolving,
    Fetching,
    Composing,
    Done,
    Failed,
}

impl Stage {
    /// Position in the happy path; Failed ranks below everything so a
    /// failed manifest never short-circuits a later stage.
    fn rank(self) -> u8 {
        match self {
            Stage::Failed => 0,
            Stage::Validating => 1,
            Stage::Resolving => 2,
            Stage::Fetching => 3,
            Stage::Composing => 4,
            Stage::Done => 5,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Composing => "composing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint files
// ---------------------------------------------------------------------------

/// Marker for the furthest completed stage.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    stage: Stage,
    invalid_variables: Vec<String>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Manifest {
    fn at(stage: Stage) -> Self {
        Manifest {
            stage,
            invalid_variables: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Fetch-stage artifact: the metric table plus its column order. The
/// request shape is recorded so a resume with different variables or
/// scope refetches instead of serving stale columns.
#[derive(Debug, Serialize, Deserialize)]
struct MetricsCheckpoint {
    aoi: Aoi,
    variables: Vec<String>,
    columns: Vec<String>,
    rows: Vec<MetricRow>,
}

struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    fn new(dir: &str) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| PipelineError::Store(format!("{}: {}", dir, e)))?;
        Ok(CheckpointDir { dir: PathBuf::from(dir) })
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join("catalog.json")
    }

    fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.json")
    }

    fn default_output_path(&self) -> PathBuf {
        self.dir.join("enriched.csv")
    }

    /// Corrupt or missing files read as None: a damaged checkpoint
    /// degrades to redoing the stage, never to failing the run.
    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), PipelineError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| PipelineError::Store(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| PipelineError::Store(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    fn mark(&self, manifest: &Manifest) -> Result<(), PipelineError> {
        self.write_json(&self.manifest_path(), manifest)
    }

    fn clear_stage_artifacts(&self) {
        let _ = std::fs::remove_file(self.catalog_path());
        let _ = std::fs::remove_file(self.metrics_path());
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PipelineRequest {
    pub sites: Vec<Site>,
    pub variables: Vec<String>,
    pub aoi: Aoi,
    /// Re-resolve sites even when the link store already has them.
    pub force_resolve: bool,
    /// Where to write the enriched table; defaults into the checkpoint
    /// directory.
    pub output_path: Option<PathBuf>,
}

pub struct PipelineServices<'a> {
    pub variables: &'a dyn VariableSource,
    pub comids: &'a dyn ComidLookup,
    pub metrics: &'a dyn MetricSource,
}

#[derive(Debug)]
pub struct PipelineReport {
    /// Done, or Failed when validation rejected the variable list.
    pub stage: Stage,
    pub enriched: Vec<EnrichedSite>,
    /// Requested variables not present in the catalog, request order.
    pub invalid_variables: Vec<String>,
    pub resolution_errors: Vec<String>,
    pub fetch_errors: Vec<String>,
    pub sites_skipped: usize,
    pub output_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<'a> {
    config: &'a ServiceConfig,
    services: PipelineServices<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a ServiceConfig, services: PipelineServices<'a>) -> Self {
        Pipeline { config, services }
    }

    pub fn run(
        &self,
        request: &PipelineRequest,
        rules: &[DeriveRule],
        cancel: &CancelFlag,
    ) -> Result<PipelineReport, PipelineError> {
        let checkpoints = CheckpointDir::new(&self.config.checkpoint_dir)?;

        // A manifest mid-flight means an interrupted run: resume it.
        // Done/Failed (or no manifest) means a fresh run, which drops
        // the previous run's catalog and metric snapshots.
        let previous: Option<Manifest> = checkpoints.read_json(&checkpoints.manifest_path());
        let resuming = matches!(
            &previous,
            Some(m) if m.stage != Stage::Done && m.stage != Stage::Failed
        );
        let completed_rank = if resuming {
            previous.as_ref().map(|m| m.stage.rank()).unwrap_or(0)
        } else {
            checkpoints.clear_stage_artifacts();
            0
        };
        if resuming {
            logging::info(
                DataSource::System,
                None,
                &format!(
                    "resuming interrupted run (last completed stage: {})",
                    previous.as_ref().map(|m| m.stage.to_string()).unwrap_or_default()
                ),
            );
        }

        // --- Validating ----------------------------------------------------
        logging::info(DataSource::System, None, "stage: validating");

        let catalog = self.load_catalog(&checkpoints, completed_rank)?;
        let invalid = catalog.validate(&request.variables);
        if !invalid.is_empty() {
            let mut manifest = Manifest::at(Stage::Failed);
            manifest.invalid_variables = invalid.clone();
            checkpoints.mark(&manifest)?;
            logging::error(
                DataSource::StreamCat,
                None,
                &format!("invalid variables: {}", invalid.join(", ")),
            );
            return Ok(PipelineReport {
                stage: Stage::Failed,
                enriched: Vec::new(),
                invalid_variables: invalid,
                resolution_errors: Vec::new(),
                fetch_errors: Vec::new(),
                sites_skipped: 0,
                output_path: None,
            });
        }
        checkpoints.write_json(&checkpoints.catalog_path(), &catalog.specs().to_vec())?;
        checkpoints.mark(&Manifest::at(Stage::Validating))?;

        // --- Resolving -----------------------------------------------------
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        logging::info(DataSource::System, None, "stage: resolving");

        // The link store is its own durable checkpoint, and resolution
        // skips already-resolved sites, so this stage always runs; a
        // completed stage just makes no remote calls.
        let mut store = LinkStore::open(Path::new(&self.config.link_store_path))?;
        let resolver = Resolver::new(
            self.services.comids,
            self.config.retry_policy(),
            self.config.resolve_batch_size,
        )
        .force(request.force_resolve);
        let resolution = resolver.resolve(&mut store, &request.sites, &self.config.crs, cancel)?;
        checkpoints.mark(&Manifest::at(Stage::Resolving))?;

        // --- Fetching ------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        logging::info(DataSource::System, None, "stage: fetching");

        let comids: Vec<String> = request
            .sites
            .iter()
            .filter_map(|site| resolution.links.get(&site.site_id))
            .filter_map(|link| link.comid.clone())
            .collect();

        let checkpoint: Option<MetricsCheckpoint> = if completed_rank >= Stage::Fetching.rank() {
            checkpoints
                .read_json::<MetricsCheckpoint>(&checkpoints.metrics_path())
                .filter(|c| c.aoi == request.aoi && c.variables == request.variables)
        } else {
            None
        };

        let (rows, columns, fetch_errors) = match checkpoint {
            Some(saved) => {
                logging::info(DataSource::StreamCat, None, "metrics restored from checkpoint");
                (saved.rows, saved.columns, Vec::new())
            }
            None => {
                let fetcher = MetricFetcher::new(
                    self.services.metrics,
                    self.config.retry_policy(),
                    self.config.metrics_batch_size,
                    self.config.column_naming,
                );
                let outcome =
                    fetcher.fetch(&comids, &request.variables, &catalog, request.aoi, cancel)?;
                checkpoints.write_json(
                    &checkpoints.metrics_path(),
                    &MetricsCheckpoint {
                        aoi: request.aoi,
                        variables: request.variables.clone(),
                        columns: outcome.columns.clone(),
                        rows: outcome.rows.clone(),
                    },
                )?;
                (outcome.rows, outcome.columns, outcome.chunk_errors)
            }
        };
        checkpoints.mark(&Manifest::at(Stage::Fetching))?;

        // --- Composing -----------------------------------------------------
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        logging::info(DataSource::System, None, "stage: composing");

        let mut enriched = merge_onto_sites(&request.sites, &resolution.links, &rows, &columns);
        compose(&mut enriched, rules);
        checkpoints.mark(&Manifest::at(Stage::Composing))?;

        let output_path = request
            .output_path
            .clone()
            .unwrap_or_else(|| checkpoints.default_output_path());
        write_enriched_csv(&output_path, &enriched)?;
        checkpoints.mark(&Manifest::at(Stage::Done))?;
        logging::info(
            DataSource::System,
            None,
            &format!("done: {} rows -> {}", enriched.len(), output_path.display()),
        );

        Ok(PipelineReport {
            stage: Stage::Done,
            enriched,
            invalid_variables: Vec::new(),
            resolution_errors: resolution.batch_errors.iter().map(|e| e.to_string()).collect(),
            fetch_errors: fetch_errors.iter().map(|e| e.to_string()).collect(),
            sites_skipped: resolution.skipped,
            output_path: Some(output_path),
        })
    }

    /// Catalog from the interrupted run's snapshot when resuming, fresh
    /// from the remote otherwise. Exhausted retries are fatal: nothing
    /// can be validated without a catalog.
    fn load_catalog(
        &self,
        checkpoints: &CheckpointDir,
        completed_rank: u8,
    ) -> Result<VariableCatalog, PipelineError> {
        if completed_rank >= Stage::Validating.rank() {
            if let Some(specs) =
                checkpoints.read_json::<Vec<VariableSpec>>(&checkpoints.catalog_path())
            {
                logging::info(DataSource::StreamCat, None, "catalog restored from checkpoint");
                return Ok(VariableCatalog::from_specs(specs));
            }
        }
        let result =
            VariableCatalog::load(self.services.variables, &self.config.retry_policy());
        if let Err(err) = &result {
            let mut manifest = Manifest::at(Stage::Failed);
            manifest.error = Some(err.to_string());
            checkpoints.mark(&manifest)?;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Output table
// ---------------------------------------------------------------------------

/// Writes the enriched table. Metric columns come from the first row's
/// map; every row carries the same keys by construction.
pub fn write_enriched_csv(path: &Path, rows: &[EnrichedSite]) -> Result<(), PipelineError> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|e| PipelineError::Store(format!("{}: {}", path.display(), e)))?;

    let metric_columns: Vec<&String> = rows
        .first()
        .map(|row| row.metrics.keys().collect())
        .unwrap_or_default();

    let mut header = vec![
        "site_id".to_string(),
        "longitude".to_string(),
        "latitude".to_string(),
        "comid".to_string(),
    ];
    header.extend(metric_columns.iter().map(|c| c.to_string()));
    wtr.write_record(&header)
        .map_err(|e| PipelineError::Store(e.to_string()))?;

    for row in rows {
        let mut record = vec![
            row.site_id.clone(),
            row.longitude.to_string(),
            row.latitude.to_string(),
            row.comid.clone().unwrap_or_default(),
        ];
        for column in &metric_columns {
            record.push(
                row.metrics
                    .get(*column)
                    .copied()
                    .flatten()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        wtr.write_record(&record)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
    }
    wtr.flush()
        .map_err(|e| PipelineError::Store(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
