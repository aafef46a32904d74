/// Remote service clients.
///
/// Submodules:
/// - `retry`: bounded exponential-backoff runner shared by all clients.
/// - `waters`: point-indexing service (coordinates -> COMIDs).
/// - `streamcat`: metric and variable-catalog service.

use std::time::Duration;

use crate::model::PipelineError;

pub mod retry;
pub mod streamcat;
pub mod waters;

/// Builds the blocking HTTP client shared by the remote clients.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, PipelineError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::Transport(e.to_string()))
}

/// Maps a blocking response to its body text, converting HTTP and
/// transport failures into pipeline errors.
pub(crate) fn read_body(response: reqwest::blocking::Response) -> Result<String, PipelineError> {
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::HttpStatus(status.as_u16()));
    }
    response
        .text()
        .map_err(|e| PipelineError::Transport(e.to_string()))
}
