/// Durable site -> catchment link table.
///
/// A keyed flat file (CSV) holding one row per site id with its resolved
/// COMID or an unresolved marker. The whole table is loaded at open and
/// rewritten through a temp file + rename on every batch flush, so a
/// crash mid-run loses at most the in-flight batch. Last write wins per
/// site id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CatchmentLink, PipelineError};

// ---------------------------------------------------------------------------
// On-disk record
// ---------------------------------------------------------------------------

/// One CSV row. `status` is redundant with `comid` but keeps the file
/// greppable without knowing the empty-field convention.
#[derive(Debug, Serialize, Deserialize)]
struct StoreRecord {
    site_id: String,
    longitude: f64,
    latitude: f64,
    comid: Option<String>,
    status: String,
    resolved_at: Option<DateTime<Utc>>,
}

impl StoreRecord {
    fn from_link(link: &CatchmentLink) -> Self {
        StoreRecord {
            site_id: link.site_id.clone(),
            longitude: link.longitude,
            latitude: link.latitude,
            comid: link.comid.clone(),
            status: if link.is_resolved() { "resolved" } else { "unresolved" }.to_string(),
            resolved_at: link.resolved_at,
        }
    }

    fn into_link(self) -> CatchmentLink {
        CatchmentLink {
            site_id: self.site_id,
            longitude: self.longitude,
            latitude: self.latitude,
            comid: self.comid,
            resolved_at: self.resolved_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct LinkStore {
    path: PathBuf,
    links: BTreeMap<String, CatchmentLink>,
}

impl LinkStore {
    /// Opens the store, reading any existing table. A missing file means
    /// an empty store; the file is created on first flush.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let mut links = BTreeMap::new();

        if path.exists() {
            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)
                .map_err(|e| PipelineError::Store(format!("{}: {}", path.display(), e)))?;
            for result in rdr.deserialize::<StoreRecord>() {
                let record =
                    result.map_err(|e| PipelineError::Store(format!("{}: {}", path.display(), e)))?;
                let link = record.into_link();
                links.insert(link.site_id.clone(), link);
            }
        }

        Ok(LinkStore {
            path: path.to_path_buf(),
            links,
        })
    }

    pub fn get(&self, site_id: &str) -> Option<&CatchmentLink> {
        self.links.get(site_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> impl Iterator<Item = &CatchmentLink> {
        self.links.values()
    }

    /// Upserts a batch of links and flushes the table to disk before
    /// returning, so a completed batch survives a crash.
    pub fn upsert_batch(&mut self, batch: &[CatchmentLink]) -> Result<(), PipelineError> {
        for link in batch {
            self.links.insert(link.site_id.clone(), link.clone());
        }
        self.flush()
    }

    /// Rewrites the whole table through a temp file and atomic rename.
    fn flush(&self) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::Store(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut wtr = csv::Writer::from_path(&tmp)
                .map_err(|e| PipelineError::Store(format!("{}: {}", tmp.display(), e)))?;
            for link in self.links.values() {
                wtr.serialize(StoreRecord::from_link(link))
                    .map_err(|e| PipelineError::Store(format!("{}: {}", tmp.display(), e)))?;
            }
            wtr.flush()
                .map_err(|e| PipelineError::Store(format!("{}: {}", tmp.display(), e)))?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| PipelineError::Store(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
