/// Site resolution: batched coordinate -> COMID lookup with durable
/// progress.
///
/// Sites already resolved in the link store are skipped without a remote
/// call, so re-running a partially failed job only pays for what is
/// still missing. Each batch that completes (or conclusively fails) is
/// flushed to the store before the next one starts.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::ingest::retry::RetryPolicy;
use crate::logging::{self, DataSource};
use crate::model::{CancelFlag, CatchmentLink, PipelineError, Site};
use crate::store::LinkStore;

// ---------------------------------------------------------------------------
// Lookup seam
// ---------------------------------------------------------------------------

/// One round trip to the point-indexing service: a batch of coordinate
/// pairs in, the raw delimited response body out. Parsing stays on this
/// side of the seam so the count check below applies to every
/// implementation.
pub trait ComidLookup {
    fn lookup_batch(&self, points: &[(f64, f64)], crs: &str) -> Result<String, PipelineError>;
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Splits the delimited identifier response and verifies one identifier
/// per input point. The service correlates results with the request by
/// position only and does not verify the count itself, so a short or
/// long response here means positional pairing would attach COMIDs to
/// the wrong sites, so the whole batch is rejected instead.
pub fn parse_comid_response(body: &str, expected: usize) -> Result<Vec<String>, PipelineError> {
    let trimmed = body.trim();
    let tokens: Vec<String> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split(',').map(|t| t.trim().to_string()).collect()
    };

    if tokens.iter().any(|t| t.is_empty()) {
        return Err(PipelineError::Parse(
            "empty identifier in point-indexing response".to_string(),
        ));
    }
    if tokens.len() != expected {
        return Err(PipelineError::ResolutionCountMismatch {
            expected,
            got: tokens.len(),
        });
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ResolutionOutcome {
    /// Exactly one link per input site id.
    pub links: BTreeMap<String, CatchmentLink>,
    /// Errors from batches that exhausted their retries. Their sites are
    /// present in `links` as unresolved.
    pub batch_errors: Vec<PipelineError>,
    /// Sites skipped because the store already had a resolved link.
    pub skipped: usize,
}

impl ResolutionOutcome {
    pub fn resolved_count(&self) -> usize {
        self.links.values().filter(|l| l.is_resolved()).count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.links.len() - self.resolved_count()
    }
}

pub struct Resolver<'a> {
    lookup: &'a dyn ComidLookup,
    retry: RetryPolicy,
    batch_size: usize,
    force: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(lookup: &'a dyn ComidLookup, retry: RetryPolicy, batch_size: usize) -> Self {
        Resolver {
            lookup,
            retry,
            batch_size: batch_size.max(1),
            force: false,
        }
    }

    /// Re-resolve sites even when the store already has a resolved link.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Resolves every site to a catchment link, one per input site id.
    ///
    /// Batches that exhaust their retries leave their sites unresolved
    /// and surface the error in the outcome; the run itself only fails
    /// on store errors or cancellation.
    pub fn resolve(
        &self,
        store: &mut LinkStore,
        sites: &[Site],
        crs: &str,
        cancel: &CancelFlag,
    ) -> Result<ResolutionOutcome, PipelineError> {
        let mut links = BTreeMap::new();
        let mut pending: Vec<&Site> = Vec::new();
        let mut skipped = 0;

        for site in sites {
            if !self.force {
                if let Some(existing) = store.get(&site.site_id) {
                    if existing.is_resolved() {
                        links.insert(site.site_id.clone(), existing.clone());
                        skipped += 1;
                        continue;
                    }
                }
            }
            pending.push(site);
        }

        if skipped > 0 {
            logging::info(
                DataSource::Waters,
                None,
                &format!("{} sites already resolved, skipping", skipped),
            );
        }

        let mut batch_errors = Vec::new();
        let lookup = self.lookup;

        for batch in pending.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let points: Vec<(f64, f64)> =
                batch.iter().map(|s| (s.longitude, s.latitude)).collect();

            let attempt = self.retry.run(|| {
                let body = lookup.lookup_batch(&points, crs)?;
                parse_comid_response(&body, batch.len())
            });

            let batch_links: Vec<CatchmentLink> = match attempt {
                Ok(comids) => {
                    let now = Utc::now();
                    batch
                        .iter()
                        .zip(comids)
                        .map(|(site, comid)| CatchmentLink::resolved(site, comid, now))
                        .collect()
                }
                Err(err) => {
                    let site_ids: Vec<String> =
                        batch.iter().map(|s| s.site_id.clone()).collect();
                    logging::log_resolution_failure(&site_ids, &err);
                    batch_errors.push(err);
                    batch.iter().map(|site| CatchmentLink::unresolved(site)).collect()
                }
            };

            // Durable checkpoint: a crash from here on loses nothing from
            // this batch.
            store.upsert_batch(&batch_links)?;
            for link in batch_links {
                links.insert(link.site_id.clone(), link);
            }
        }

        let outcome = ResolutionOutcome {
            links,
            batch_errors,
            skipped,
        };
        logging::log_batch_summary(
            DataSource::Waters,
            "resolution",
            sites.len(),
            outcome.resolved_count(),
            outcome.unresolved_count(),
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
