/// Metric fetching: chunked retrieval of catchment/watershed statistics
/// and the merge back onto the site table.
///
/// Variables must have passed catalog validation before anything is
/// fetched; handing this module an unvalidated list is a programming
/// error, not a retryable fault. Remote column names are remapped to the
/// configured convention here so nothing downstream ever sees the
/// service's casing.

use std::collections::BTreeMap;

use crate::catalog::VariableCatalog;
use crate::ingest::retry::RetryPolicy;
use crate::logging::{self, DataSource};
use crate::model::{
    Aoi, CancelFlag, CatchmentLink, ColumnNaming, EnrichedSite, MetricRow, PipelineError, Site,
};

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// Raw metric columns for one catchment, keyed by the remote column name.
pub type RawColumns = BTreeMap<String, Option<f64>>;

/// One round trip to the metric service for a chunk of COMIDs.
pub trait MetricSource {
    fn fetch_metrics(
        &self,
        variables: &[String],
        aoi: Aoi,
        comids: &[String],
    ) -> Result<Vec<(String, RawColumns)>, PipelineError>;
}

// ---------------------------------------------------------------------------
// Column naming
// ---------------------------------------------------------------------------

/// (remote column, output column) pairs for the requested variables.
/// The remote service uppercases the short name and appends the scope
/// suffix; the output name follows the configured convention.
fn column_map(variables: &[String], aoi: Aoi, naming: ColumnNaming) -> Vec<(String, String)> {
    variables
        .iter()
        .map(|name| {
            let remote = format!("{}{}", name.to_uppercase(), aoi.column_suffix());
            let output = match naming {
                ColumnNaming::Remote => remote.clone(),
                ColumnNaming::ScopedSnake => format!(
                    "{}_{}",
                    name.to_lowercase(),
                    aoi.column_suffix().to_lowercase()
                ),
            };
            (remote, output)
        })
        .collect()
}

fn remap_columns(raw: &RawColumns, map: &[(String, String)]) -> BTreeMap<String, Option<f64>> {
    let mut values = BTreeMap::new();
    for (remote, output) in map {
        let value = raw.get(remote).copied().flatten().or_else(|| {
            // The service has been seen to vary casing between releases.
            raw.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(remote))
                .and_then(|(_, v)| *v)
        });
        values.insert(output.clone(), value);
    }
    values
}

fn null_columns(map: &[(String, String)]) -> BTreeMap<String, Option<f64>> {
    map.iter().map(|(_, output)| (output.clone(), None)).collect()
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FetchOutcome {
    /// One row per distinct requested COMID, in request order.
    pub rows: Vec<MetricRow>,
    /// Output column names, in requested-variable order.
    pub columns: Vec<String>,
    /// Errors from chunks that exhausted their retries. Their COMIDs are
    /// present in `rows` with all-null values.
    pub chunk_errors: Vec<PipelineError>,
}

pub struct MetricFetcher<'a> {
    source: &'a dyn MetricSource,
    retry: RetryPolicy,
    chunk_size: usize,
    naming: ColumnNaming,
}

impl<'a> MetricFetcher<'a> {
    pub fn new(
        source: &'a dyn MetricSource,
        retry: RetryPolicy,
        chunk_size: usize,
        naming: ColumnNaming,
    ) -> Self {
        MetricFetcher {
            source,
            retry,
            chunk_size: chunk_size.max(1),
            naming,
        }
    }

    /// Fetches the requested variables for every COMID, chunking to the
    /// configured batch size. A chunk that exhausts its retries yields
    /// all-null rows for its COMIDs rather than aborting the fetch.
    pub fn fetch(
        &self,
        comids: &[String],
        variables: &[String],
        catalog: &VariableCatalog,
        aoi: Aoi,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome, PipelineError> {
        let invalid = catalog.validate(variables);
        if !invalid.is_empty() {
            return Err(PipelineError::InvalidVariableSet(invalid));
        }

        let map = column_map(variables, aoi, self.naming);
        let columns: Vec<String> = map.iter().map(|(_, output)| output.clone()).collect();

        // Distinct COMIDs, preserving first-seen order.
        let mut distinct: Vec<String> = Vec::new();
        for comid in comids {
            if !distinct.contains(comid) {
                distinct.push(comid.clone());
            }
        }

        let mut rows = Vec::with_capacity(distinct.len());
        let mut chunk_errors = Vec::new();
        let source = self.source;

        for chunk in distinct.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let attempt = self.retry.run(|| source.fetch_metrics(variables, aoi, chunk));

            match attempt {
                Ok(raw_rows) => {
                    let by_comid: BTreeMap<&str, &RawColumns> =
                        raw_rows.iter().map(|(c, v)| (c.as_str(), v)).collect();
                    for comid in chunk {
                        let values = match by_comid.get(comid.as_str()) {
                            Some(raw) => remap_columns(raw, &map),
                            // The service silently omits COMIDs it has no
                            // data for; keep the row, null the values.
                            None => null_columns(&map),
                        };
                        rows.push(MetricRow {
                            comid: comid.clone(),
                            aoi,
                            values,
                        });
                    }
                }
                Err(err) => {
                    logging::log_fetch_failure(chunk, &err);
                    chunk_errors.push(err);
                    for comid in chunk {
                        rows.push(MetricRow {
                            comid: comid.clone(),
                            aoi,
                            values: null_columns(&map),
                        });
                    }
                }
            }
        }

        logging::log_batch_summary(
            DataSource::StreamCat,
            "metric fetch",
            distinct.len(),
            rows.iter().filter(|r| r.values.values().any(|v| v.is_some())).count(),
            chunk_errors.len(),
        );

        Ok(FetchOutcome {
            rows,
            columns,
            chunk_errors,
        })
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Joins fetched metrics back onto the site table by COMID.
///
/// Exactly one output row per input site: sites sharing a COMID each get
/// the full metric row, and sites with no resolved COMID (or whose COMID
/// is missing from `rows`) get null values for every column.
pub fn merge_onto_sites(
    sites: &[Site],
    links: &BTreeMap<String, CatchmentLink>,
    rows: &[MetricRow],
    columns: &[String],
) -> Vec<EnrichedSite> {
    let by_comid: BTreeMap<&str, &MetricRow> =
        rows.iter().map(|r| (r.comid.as_str(), r)).collect();
    let nulls: BTreeMap<String, Option<f64>> =
        columns.iter().map(|c| (c.clone(), None)).collect();

    sites
        .iter()
        .map(|site| {
            let comid = links
                .get(&site.site_id)
                .and_then(|link| link.comid.clone());
            let metrics = comid
                .as_deref()
                .and_then(|c| by_comid.get(c))
                .map(|row| row.values.clone())
                .unwrap_or_else(|| nulls.clone());
            EnrichedSite {
                site_id: site.site_id.clone(),
                longitude: site.longitude,
                latitude: site.latitude,
                comid,
                metrics,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariableSpec;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn catalog() -> VariableCatalog {
        VariableCatalog::from_specs(vec![
            VariableSpec {
                short_name: "pctdecid2019".to_string(),
                full_name: "% deciduous forest 2019".to_string(),
            },
            VariableSpec {
                short_name: "pctconif2019".to_string(),
                full_name: "% coniferous forest 2019".to_string(),
            },
        ])
    }

    fn vars(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn raw_row(comid: &str, cols: &[(&str, Option<f64>)]) -> (String, RawColumns) {
        (
            comid.to_string(),
            cols.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        )
    }

    struct FakeMetrics {
        responses: RefCell<VecDeque<Result<Vec<(String, RawColumns)>, PipelineError>>>,
        chunk_sizes: RefCell<Vec<usize>>,
    }

    impl FakeMetrics {
        fn scripted(responses: Vec<Result<Vec<(String, RawColumns)>, PipelineError>>) -> Self {
            FakeMetrics {
                responses: RefCell::new(responses.into()),
                chunk_sizes: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.chunk_sizes.borrow().len()
        }
    }

    impl MetricSource for FakeMetrics {
        fn fetch_metrics(
            &self,
            _variables: &[String],
            _aoi: Aoi,
            comids: &[String],
        ) -> Result<Vec<(String, RawColumns)>, PipelineError> {
            self.chunk_sizes.borrow_mut().push(comids.len());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(PipelineError::Transport("no scripted response".into())))
        }
    }

    fn fetcher<'a>(source: &'a FakeMetrics, chunk_size: usize, naming: ColumnNaming) -> MetricFetcher<'a> {
        MetricFetcher::new(source, RetryPolicy::new(1, 0), chunk_size, naming)
    }

    fn comids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // --- Preconditions ------------------------------------------------------

    #[test]
    fn test_unvalidated_variables_are_a_programming_error() {
        let source = FakeMetrics::scripted(vec![]);
        let err = fetcher(&source, 10, ColumnNaming::Remote)
            .fetch(
                &comids(&["4000390"]),
                &vars(&["pctdecid201"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap_err();

        assert_eq!(
            err,
            PipelineError::InvalidVariableSet(vec!["pctdecid201".to_string()])
        );
        // Validation happens strictly before any network cost.
        assert_eq!(source.calls(), 0);
    }

    // --- Column remapping ---------------------------------------------------

    #[test]
    fn test_remote_naming_keeps_service_columns() {
        let source = FakeMetrics::scripted(vec![Ok(vec![raw_row(
            "4000390",
            &[("PCTDECID2019WS", Some(42.7))],
        )])]);
        let outcome = fetcher(&source, 10, ColumnNaming::Remote)
            .fetch(
                &comids(&["4000390"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(outcome.columns, vec!["PCTDECID2019WS".to_string()]);
        assert_eq!(outcome.rows[0].values["PCTDECID2019WS"], Some(42.7));
    }

    #[test]
    fn test_scoped_snake_naming_remaps_columns() {
        let source = FakeMetrics::scripted(vec![Ok(vec![raw_row(
            "4000390",
            &[("PCTDECID2019CAT", Some(12.5))],
        )])]);
        let outcome = fetcher(&source, 10, ColumnNaming::ScopedSnake)
            .fetch(
                &comids(&["4000390"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Catchment,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(outcome.columns, vec!["pctdecid2019_cat".to_string()]);
        assert_eq!(outcome.rows[0].values["pctdecid2019_cat"], Some(12.5));
    }

    #[test]
    fn test_unexpected_remote_casing_still_maps() {
        let source = FakeMetrics::scripted(vec![Ok(vec![raw_row(
            "4000390",
            &[("PctDecid2019Ws", Some(42.7))],
        )])]);
        let outcome = fetcher(&source, 10, ColumnNaming::Remote)
            .fetch(
                &comids(&["4000390"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(outcome.rows[0].values["PCTDECID2019WS"], Some(42.7));
    }

    // --- Chunking and partial failure --------------------------------------

    #[test]
    fn test_comids_are_chunked_and_results_concatenated() {
        let source = FakeMetrics::scripted(vec![
            Ok(vec![
                raw_row("1", &[("PCTDECID2019WS", Some(1.0))]),
                raw_row("2", &[("PCTDECID2019WS", Some(2.0))]),
            ]),
            Ok(vec![raw_row("3", &[("PCTDECID2019WS", Some(3.0))])]),
        ]);
        let outcome = fetcher(&source, 2, ColumnNaming::Remote)
            .fetch(
                &comids(&["1", "2", "3"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(*source.chunk_sizes.borrow(), vec![2, 1]);
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.rows[2].values["PCTDECID2019WS"], Some(3.0));
    }

    #[test]
    fn test_duplicate_comids_are_fetched_once() {
        let source = FakeMetrics::scripted(vec![Ok(vec![
            raw_row("1", &[("PCTDECID2019WS", Some(1.0))]),
            raw_row("2", &[("PCTDECID2019WS", Some(2.0))]),
        ])]);
        let outcome = fetcher(&source, 10, ColumnNaming::Remote)
            .fetch(
                &comids(&["1", "1", "2"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(*source.chunk_sizes.borrow(), vec![2]);
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn test_failed_chunk_yields_null_rows_not_an_abort() {
        let source = FakeMetrics::scripted(vec![
            Err(PipelineError::HttpStatus(503)),
            Ok(vec![raw_row("2", &[("PCTDECID2019WS", Some(2.0))])]),
        ]);
        let outcome = fetcher(&source, 1, ColumnNaming::Remote)
            .fetch(
                &comids(&["1", "2"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].values["PCTDECID2019WS"], None);
        assert_eq!(outcome.rows[1].values["PCTDECID2019WS"], Some(2.0));
        assert_eq!(outcome.chunk_errors, vec![PipelineError::HttpStatus(503)]);
    }

    #[test]
    fn test_comid_missing_from_response_gets_null_row() {
        let source = FakeMetrics::scripted(vec![Ok(vec![raw_row(
            "1",
            &[("PCTDECID2019WS", Some(1.0))],
        )])]);
        let outcome = fetcher(&source, 10, ColumnNaming::Remote)
            .fetch(
                &comids(&["1", "99"]),
                &vars(&["pctdecid2019"]),
                &catalog(),
                Aoi::Watershed,
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[1].comid, "99");
        assert_eq!(outcome.rows[1].values["PCTDECID2019WS"], None);
    }

    // --- Merge --------------------------------------------------------------

    fn site(id: &str) -> Site {
        Site {
            site_id: id.to_string(),
            longitude: -81.0,
            latitude: 41.0,
        }
    }

    fn link(site_id: &str, comid: Option<&str>) -> CatchmentLink {
        CatchmentLink {
            site_id: site_id.to_string(),
            longitude: -81.0,
            latitude: 41.0,
            comid: comid.map(String::from),
            resolved_at: None,
        }
    }

    #[test]
    fn test_merge_preserves_fan_out_and_row_count() {
        let table = vec![site("a"), site("b"), site("c")];
        let mut links = BTreeMap::new();
        // Two sites share a catchment; the third is unresolved.
        links.insert("a".to_string(), link("a", Some("100")));
        links.insert("b".to_string(), link("b", Some("100")));
        links.insert("c".to_string(), link("c", None));

        let rows = vec![MetricRow {
            comid: "100".to_string(),
            aoi: Aoi::Watershed,
            values: BTreeMap::from([("PCTDECID2019WS".to_string(), Some(42.7))]),
        }];
        let columns = vec!["PCTDECID2019WS".to_string()];

        let enriched = merge_onto_sites(&table, &links, &rows, &columns);

        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched[0].metric("PCTDECID2019WS"), Some(42.7));
        assert_eq!(enriched[1].metric("PCTDECID2019WS"), Some(42.7));
        // Unresolved site keeps its row with null metrics.
        assert_eq!(enriched[2].comid, None);
        assert_eq!(enriched[2].metric("PCTDECID2019WS"), None);
        assert!(enriched[2].metrics.contains_key("PCTDECID2019WS"));
    }

    #[test]
    fn test_merge_site_with_unfetched_comid_gets_nulls() {
        let table = vec![site("a")];
        let mut links = BTreeMap::new();
        links.insert("a".to_string(), link("a", Some("999")));

        let enriched = merge_onto_sites(&table, &links, &[], &["PCTDECID2019WS".to_string()]);

        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].comid.as_deref(), Some("999"));
        assert_eq!(enriched[0].metric("PCTDECID2019WS"), None);
    }
}
