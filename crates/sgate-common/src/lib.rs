pub mod cipher;
pub mod config;
pub mod ids;

pub use cipher::{CipherError, CipherMode, CredentialCipher, AesGcmCipher};
pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use ids::new_trace_id;
