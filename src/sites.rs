/// Input site table loading and validation.
///
/// The pipeline takes its sites from a CSV table with `site_id`,
/// `longitude`, `latitude` headers. Rows are validated on load so bad
/// coordinates fail fast instead of being shipped to the point-indexing
/// service, and duplicate ids are rejected because the durable link
/// store is keyed by site id.

use std::collections::HashSet;
use std::error::Error;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::ReaderBuilder;

use crate::model::Site;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Loads and validates a site table from a CSV file.
pub fn load_sites(path: &Path) -> Result<Vec<Site>, Box<dyn Error>> {
    let file = File::open(path)
        .map_err(|e| format!("cannot open site table {}: {}", path.display(), e))?;
    load_sites_from_reader(BufReader::new(file))
}

/// Loads and validates a site table from any reader. Split out from
/// `load_sites` so tests can feed CSV text directly.
pub fn load_sites_from_reader<R: Read>(reader: R) -> Result<Vec<Site>, Box<dyn Error>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut sites = Vec::new();
    let mut seen = HashSet::new();

    for (i, result) in rdr.deserialize::<Site>().enumerate() {
        let row = i + 2; // 1-based, after the header line
        let site: Site = result.map_err(|e| format!("row {}: {}", row, e))?;

        validate_site(&site).map_err(|msg| format!("row {}: {}", row, msg))?;
        if !seen.insert(site.site_id.clone()) {
            return Err(format!("row {}: duplicate site id '{}'", row, site.site_id).into());
        }
        sites.push(site);
    }

    Ok(sites)
}

/// Checks one site row: non-empty id, finite coordinates in range.
pub fn validate_site(site: &Site) -> Result<(), String> {
    if site.site_id.is_empty() {
        return Err("empty site id".to_string());
    }
    if !site.longitude.is_finite() || !site.latitude.is_finite() {
        return Err(format!(
            "non-finite coordinates for site '{}'",
            site.site_id
        ));
    }
    if !(-180.0..=180.0).contains(&site.longitude) {
        return Err(format!(
            "longitude {} out of range for site '{}'",
            site.longitude, site.site_id
        ));
    }
    if !(-90.0..=90.0).contains(&site.latitude) {
        return Err(format!(
            "latitude {} out of range for site '{}'",
            site.latitude, site.site_id
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
