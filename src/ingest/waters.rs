/// Point-indexing client: maps coordinates to NHDPlus catchment COMIDs.
///
/// The service accepts a batch of coordinate pairs and answers with a
/// single comma-delimited string of COMIDs, one per pair, in request
/// order. Nothing in the response ties an identifier back to its input
/// pair, so callers must verify the count before positional pairing;
/// see `resolve::Resolver`.

use crate::config::ServiceConfig;
use crate::model::PipelineError;
use crate::resolve::ComidLookup;

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// Builds the lookup URL for a batch of (longitude, latitude) pairs.
pub fn build_lookup_url(endpoint: &str, points: &[(f64, f64)], crs: &str) -> String {
    let coords: Vec<String> = points
        .iter()
        .map(|(lon, lat)| format!("{},{}", lon, lat))
        .collect();
    format!("{}?crs={}&coords={}", endpoint, crs, coords.join(";"))
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct WatersClient<'a> {
    client: &'a reqwest::blocking::Client,
    endpoint: String,
}

impl<'a> WatersClient<'a> {
    pub fn new(config: &ServiceConfig, client: &'a reqwest::blocking::Client) -> Self {
        WatersClient {
            client,
            endpoint: config.waters_endpoint.clone(),
        }
    }
}

impl ComidLookup for WatersClient<'_> {
    fn lookup_batch(&self, points: &[(f64, f64)], crs: &str) -> Result<String, PipelineError> {
        let url = build_lookup_url(&self.endpoint, points, crs);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        super::read_body(response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_lookup_url_joins_pairs_in_order() {
        let url = build_lookup_url(
            "https://example.invalid/index",
            &[(-81.20298, 41.17274), (-80.9, 41.0)],
            "EPSG:4326",
        );
        assert_eq!(
            url,
            "https://example.invalid/index?crs=EPSG:4326&coords=-81.20298,41.17274;-80.9,41"
        );
    }

    #[test]
    fn test_build_lookup_url_single_point_has_no_separator() {
        let url = build_lookup_url("https://example.invalid/index", &[(-81.0, 41.0)], "EPSG:4326");
        assert!(url.ends_with("coords=-81,41"), "got: {}", url);
    }
}
