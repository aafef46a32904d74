/// Metric and variable-catalog client.
///
/// The metric service takes a comma-joined variable list, an aggregation
/// scope, and a set of COMIDs, and answers with a JSON table keyed by
/// COMID whose column names are uppercase and scope-suffixed
/// (e.g. "PCTDECID2019WS"). The catalog endpoint lists the valid metric
/// names. Column remapping to the configured naming convention happens
/// downstream in `fetch`; this module returns the remote names as-is.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::catalog::VariableSource;
use crate::config::ServiceConfig;
use crate::fetch::{MetricSource, RawColumns};
use crate::model::{Aoi, PipelineError, VariableSpec};

// ---------------------------------------------------------------------------
// Catalog response
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VariableListResponse {
    items: Vec<VariableInfo>,
}

#[derive(Debug, Deserialize)]
struct VariableInfo {
    metric_name: String,
    #[serde(default)]
    metric_description: Option<String>,
}

/// Parses the variable-catalog response. Short names are normalized to
/// lowercase; a missing description falls back to the metric name.
pub fn parse_variable_list(body: &str) -> Result<Vec<VariableSpec>, PipelineError> {
    let response: VariableListResponse =
        serde_json::from_str(body).map_err(|e| PipelineError::Parse(e.to_string()))?;
    Ok(response
        .items
        .into_iter()
        .map(|info| VariableSpec {
            short_name: info.metric_name.to_lowercase(),
            full_name: info.metric_description.unwrap_or_else(|| info.metric_name.clone()),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Metric response
// ---------------------------------------------------------------------------

/// Builds the metric-table URL for one COMID chunk.
pub fn build_metrics_url(
    endpoint: &str,
    variables: &[String],
    aoi: Aoi,
    comids: &[String],
) -> String {
    format!(
        "{}?name={}&areaOfInterest={}&comid={}",
        endpoint,
        variables.join(","),
        aoi.query_value(),
        comids.join(",")
    )
}

/// Parses the metric table into (comid, remote column -> value) rows.
///
/// The COMID key itself is matched case-insensitively and may arrive as
/// a number or a string. Metric values may be numbers, numeric strings,
/// or null; anything else is dropped from the row.
pub fn parse_metrics_response(
    body: &str,
) -> Result<Vec<(String, RawColumns)>, PipelineError> {
    let root: serde_json::Value =
        serde_json::from_str(body).map_err(|e| PipelineError::Parse(e.to_string()))?;
    let items = root
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| PipelineError::Parse("response has no 'items' array".to_string()))?;

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let object = item
            .as_object()
            .ok_or_else(|| PipelineError::Parse("metric row is not an object".to_string()))?;

        let mut comid = None;
        let mut values: RawColumns = BTreeMap::new();
        for (key, value) in object {
            if key.eq_ignore_ascii_case("comid") {
                comid = value_as_id(value);
                continue;
            }
            match value {
                serde_json::Value::Null => {
                    values.insert(key.clone(), None);
                }
                serde_json::Value::Number(n) => {
                    values.insert(key.clone(), n.as_f64());
                }
                serde_json::Value::String(s) => {
                    if let Ok(parsed) = s.parse::<f64>() {
                        values.insert(key.clone(), Some(parsed));
                    }
                }
                _ => {}
            }
        }

        let comid =
            comid.ok_or_else(|| PipelineError::Parse("metric row missing COMID".to_string()))?;
        rows.push((comid, values));
    }
    Ok(rows)
}

fn value_as_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct StreamCatClient<'a> {
    client: &'a reqwest::blocking::Client,
    metrics_endpoint: String,
    variables_endpoint: String,
}

impl<'a> StreamCatClient<'a> {
    pub fn new(config: &ServiceConfig, client: &'a reqwest::blocking::Client) -> Self {
        StreamCatClient {
            client,
            metrics_endpoint: config.metrics_endpoint.clone(),
            variables_endpoint: config.variables_endpoint.clone(),
        }
    }

    fn get(&self, url: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        super::read_body(response)
    }
}

impl VariableSource for StreamCatClient<'_> {
    fn fetch_variables(&self) -> Result<Vec<VariableSpec>, PipelineError> {
        let body = self.get(&self.variables_endpoint)?;
        parse_variable_list(&body)
    }
}

impl MetricSource for StreamCatClient<'_> {
    fn fetch_metrics(
        &self,
        variables: &[String],
        aoi: Aoi,
        comids: &[String],
    ) -> Result<Vec<(String, RawColumns)>, PipelineError> {
        let url = build_metrics_url(&self.metrics_endpoint, variables, aoi, comids);
        let body = self.get(&url)?;
        parse_metrics_response(&body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
