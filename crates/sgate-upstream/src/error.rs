/// Failure taxonomy for a single upstream call.
///
/// The scheduler treats every variant here as a provider failure; the
/// executor additionally uses the variant to pick a public-API status code
/// (see `sgate-core::error`).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("token refresh failed: {0}")]
    AuthRefresh(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream returned status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("upstream response framing malformed: {0}")]
    Protocol(String),
    #[error("upstream call timed out")]
    Timeout,
}
