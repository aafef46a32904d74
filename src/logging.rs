/// Structured logging for the enrichment pipeline.
///
/// Provides context-rich logging with site/catchment identifiers,
/// timestamps, and severity levels. Supports both console output
/// and file-based logging for unattended batch runs.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::model::PipelineError;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Data Source Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Point-indexing (coordinate -> COMID) service.
    Waters,
    /// Metric and variable-catalog service.
    StreamCat,
    /// Durable link store and checkpoint files.
    Store,
    System,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Waters => write!(f, "WATERS"),
            DataSource::StreamCat => write!(f, "STREAMCAT"),
            DataSource::Store => write!(f, "STORE"),
            DataSource::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the remote services are documented as flaky,
    /// so outages and timeouts are part of normal operation
    Expected,
    /// Unexpected failure - indicates an API change or a bug on our side
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a remote-call failure for log severity selection.
pub fn classify_remote_failure(err: &PipelineError) -> FailureType {
    match err {
        // Service-side outages and throttling happen routinely.
        PipelineError::HttpStatus(code) if *code == 429 || *code >= 500 => FailureType::Expected,
        PipelineError::Transport(_) => FailureType::Expected,
        // Client errors and unparseable bodies suggest an API change.
        PipelineError::HttpStatus(_) => FailureType::Unexpected,
        PipelineError::Parse(_) => FailureType::Unexpected,
        PipelineError::ResolutionCountMismatch { .. } => FailureType::Unexpected,
        _ => FailureType::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>) {
        let logger = Logger { min_level, log_file };
        *LOGGER.lock().unwrap() = Some(logger);
    }

    fn log(&self, level: LogLevel, source: &DataSource, key: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let key_part = key.map(|k| format!(" [{}]", k)).unwrap_or_default();
        let log_entry = format!("{} {} {}{}: {}", timestamp, level, source, key_part, message);

        match level {
            LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
            LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>) {
    Logger::init(min_level, log_file.map(String::from));
}

/// Log a general informational message
pub fn info(source: DataSource, key: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Info, &source, key, message);
    }
}

/// Log a warning message
pub fn warn(source: DataSource, key: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Warning, &source, key, message);
    }
}

/// Log an error message
pub fn error(source: DataSource, key: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Error, &source, key, message);
    }
}

/// Log a debug message
pub fn debug(source: DataSource, key: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Debug, &source, key, message);
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a failed point-indexing batch with automatic classification.
/// The batch's site ids go into the message so a persistent mismatch
/// can be diagnosed from the log alone.
pub fn log_resolution_failure(site_ids: &[String], err: &PipelineError) {
    let failure_type = classify_remote_failure(err);
    let message = format!(
        "batch of {} sites failed [{}]: {} (sites: {})",
        site_ids.len(),
        failure_type,
        err,
        site_ids.join(", ")
    );

    match failure_type {
        FailureType::Expected => warn(DataSource::Waters, None, &message),
        FailureType::Unexpected => error(DataSource::Waters, None, &message),
        FailureType::Unknown => warn(DataSource::Waters, None, &message),
    }
}

/// Log a failed metric chunk with automatic classification.
pub fn log_fetch_failure(comids: &[String], err: &PipelineError) {
    let failure_type = classify_remote_failure(err);
    let message = format!(
        "chunk of {} catchments failed [{}]: {} (comids: {})",
        comids.len(),
        failure_type,
        err,
        comids.join(", ")
    );

    match failure_type {
        FailureType::Expected => warn(DataSource::StreamCat, None, &message),
        FailureType::Unexpected => error(DataSource::StreamCat, None, &message),
        FailureType::Unknown => warn(DataSource::StreamCat, None, &message),
    }
}

// ---------------------------------------------------------------------------
// Batch Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of a batched stage
pub fn log_batch_summary(source: DataSource, stage: &str, total: usize, succeeded: usize, failed: usize) {
    let message = format!(
        "{} complete: {}/{} successful, {} failed",
        stage, succeeded, total, failed
    );

    if failed == 0 {
        info(source, None, &message);
    } else if succeeded == 0 {
        error(source, None, &message);
    } else {
        warn(source, None, &message);
    }
}
