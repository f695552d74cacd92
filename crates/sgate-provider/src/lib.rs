pub mod error;
pub mod retry;
pub mod scheduler;

pub use error::ProviderError;
pub use retry::{DEFAULT_MAX_RETRIES, retry_with_substitution};
pub use scheduler::{ProviderHandle, ProviderScheduler, SchedulerConfig};
