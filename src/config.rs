/// Runtime configuration for the enrichment pipeline.
///
/// Loaded from an optional TOML file, with environment-variable
/// overrides for the remote endpoints so deployments can repoint the
/// service without editing the config file. Every remote endpoint,
/// retry bound, batch size, and timeout lives here.

use std::path::Path;

use serde::Deserialize;

use crate::ingest::retry::RetryPolicy;
use crate::model::{ColumnNaming, CRS_WGS84};

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

pub const ENV_WATERS_ENDPOINT: &str = "SITECAT_WATERS_ENDPOINT";
pub const ENV_METRICS_ENDPOINT: &str = "SITECAT_METRICS_ENDPOINT";
pub const ENV_VARIABLES_ENDPOINT: &str = "SITECAT_VARIABLES_ENDPOINT";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Point-indexing service mapping coordinates to COMIDs.
    pub waters_endpoint: String,
    /// Metric service returning per-catchment statistic tables.
    pub metrics_endpoint: String,
    /// Catalog endpoint listing valid metric variable names.
    pub variables_endpoint: String,
    /// CRS of the input coordinates, passed through to the point index.
    pub crs: String,
    /// Coordinate pairs per point-indexing request.
    pub resolve_batch_size: usize,
    /// COMIDs per metric request. The upstream limit is undocumented, so
    /// this stays tunable.
    pub metrics_batch_size: usize,
    /// Remote attempts per batch before giving up on it.
    pub max_attempts: u32,
    /// First retry delay; doubles on each subsequent attempt.
    pub base_backoff_ms: u64,
    /// Per-request timeout. Generous, since the remote services are slow
    /// under load long before they fail outright.
    pub request_timeout_secs: u64,
    /// Directory for stage checkpoints and the final output table.
    pub checkpoint_dir: String,
    /// Durable site -> COMID link table.
    pub link_store_path: String,
    /// Naming convention for metric columns in the output.
    pub column_naming: ColumnNaming,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            waters_endpoint: "https://ofmpub.epa.gov/waters10/PointIndexing.Service".to_string(),
            metrics_endpoint: "https://api.epa.gov/StreamCat/streams/metrics".to_string(),
            variables_endpoint: "https://api.epa.gov/StreamCat/streams/variable_info".to_string(),
            crs: CRS_WGS84.to_string(),
            resolve_batch_size: 50,
            metrics_batch_size: 100,
            max_attempts: 3,
            base_backoff_ms: 500,
            request_timeout_secs: 30,
            checkpoint_dir: "./checkpoints".to_string(),
            link_store_path: "./site_comids.csv".to_string(),
            column_naming: ColumnNaming::Remote,
        }
    }
}

impl ServiceConfig {
    /// Parses a TOML document. Missing fields fall back to defaults;
    /// unknown fields are rejected so typos surface instead of being
    /// silently ignored.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid config: {}", e))
    }

    /// Reads the config file at `path`, then applies environment
    /// overrides. A missing file is not an error; defaults apply.
    pub fn load(path: &Path) -> Result<Self, String> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            Self::from_toml(&text)?
        } else {
            ServiceConfig::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies endpoint overrides from an environment lookup. Split out
    /// from `load` so tests can inject a fake environment.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get(ENV_WATERS_ENDPOINT) {
            self.waters_endpoint = url;
        }
        if let Some(url) = get(ENV_METRICS_ENDPOINT) {
            self.metrics_endpoint = url;
        }
        if let Some(url) = get(ENV_VARIABLES_ENDPOINT) {
            self.variables_endpoint = url;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sensible() {
        let config = ServiceConfig::default();
        assert_eq!(config.crs, CRS_WGS84);
        assert_eq!(config.max_attempts, 3);
        assert!(config.resolve_batch_size > 0);
        assert!(config.metrics_batch_size > 0);
        assert_eq!(config.column_naming, ColumnNaming::Remote);
    }

    #[test]
    fn test_partial_toml_keeps_defaults_for_missing_fields() {
        let config = ServiceConfig::from_toml(
            r#"
            resolve_batch_size = 10
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.resolve_batch_size, 10);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.metrics_batch_size, 100);
        assert_eq!(config.crs, CRS_WGS84);
    }

    #[test]
    fn test_column_naming_parses_from_toml() {
        let config = ServiceConfig::from_toml(r#"column_naming = "scoped_snake""#).unwrap();
        assert_eq!(config.column_naming, ColumnNaming::ScopedSnake);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = ServiceConfig::from_toml("resolve_batchsize = 10");
        assert!(result.is_err(), "typoed field should be rejected, got {:?}", result);
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let mut config = ServiceConfig::from_toml(
            r#"waters_endpoint = "https://example.invalid/from-file""#,
        )
        .unwrap();
        config.apply_env_overrides(|name| match name {
            ENV_WATERS_ENDPOINT => Some("https://example.invalid/from-env".to_string()),
            _ => None,
        });
        assert_eq!(config.waters_endpoint, "https://example.invalid/from-env");
        // Untouched endpoints keep their file/default values.
        assert_eq!(
            config.metrics_endpoint,
            ServiceConfig::default().metrics_endpoint
        );
    }
}
