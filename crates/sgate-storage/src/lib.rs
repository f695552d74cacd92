pub mod db;
pub mod entities;
pub mod storage;

pub use storage::{
    GatewayStorage, NewRequestLog, NewSession, ProviderCandidateFilter, SeaOrmStorage,
    StorageError, StorageResult,
};

#[cfg(any(test, feature = "testing"))]
pub mod fake;
