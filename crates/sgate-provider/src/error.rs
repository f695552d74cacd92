#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no provider available")]
    NoAvailableProvider,
    #[error(transparent)]
    Storage(#[from] sgate_storage::StorageError),
    #[error("provider credential could not be decrypted: {0}")]
    Credential(#[from] sgate_common::CipherError),
    #[error("decrypted credential is not valid utf-8")]
    MalformedCredential,
    /// Carries a recoverable request-executor failure (upstream transport,
    /// auth refresh, protocol framing) through the retry loop's bookkeeping
    /// without the scheduler needing to know its shape. Counts as a provider
    /// failure and is eligible for substitution.
    #[error("{0}")]
    Upstream(String),
    /// Carries a non-recoverable executor failure (request shape, internal)
    /// that should fail fast rather than burn retries substituting providers
    /// that were never the problem (§7 propagation policy).
    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether `retry_with_substitution` should attempt another provider
    /// after this error, as opposed to surfacing it immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Fatal(_))
    }
}
