//! Batch site-to-catchment enrichment service.
//!
//! Takes a table of sites with WGS84 coordinates, resolves each to an
//! NHDPlus catchment COMID through the EPA WATERS point-indexing
//! service, validates requested metric names against the StreamCat
//! variable catalog, fetches catchment- or watershed-scoped statistics
//! for the resolved COMIDs, computes derived columns, and writes an
//! enriched site table.
//!
//! The remote services fail routinely, so every remote batch is retried
//! with exponential backoff and every completed batch is checkpointed:
//! resolved links land in a durable keyed table immediately, and each
//! pipeline stage leaves an artifact a restarted run picks up.

pub mod catalog;
pub mod compose;
pub mod config;
pub mod fetch;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod resolve;
pub mod sites;
pub mod store;
