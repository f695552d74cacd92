use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults. There is no DB-stored config layer; unlike
/// provider/session state, these knobs are process-wide and cheap to pass on the
/// command line every restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Base64-encoded 32-byte key used by the credential cipher.
    pub crypto_secret_key: String,
    pub credential_cipher_mode: super::cipher::CipherMode,
    pub session_ttl_ms: i64,
    pub max_sessions_per_user: u32,
    pub session_cleanup_interval_ms: u64,
    pub provider_max_concurrent_default: i32,
    pub provider_health_threshold: i32,
    pub provider_cooldown_ms: i64,
    pub provider_failure_threshold: i32,
}

/// Optional layer used for merging global config from CLI/env before defaults
/// are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub crypto_secret_key: Option<String>,
    pub credential_cipher_mode: Option<super::cipher::CipherMode>,
    pub session_ttl_ms: Option<i64>,
    pub max_sessions_per_user: Option<u32>,
    pub session_cleanup_interval_ms: Option<u64>,
    pub provider_max_concurrent_default: Option<i32>,
    pub provider_health_threshold: Option<i32>,
    pub provider_cooldown_ms: Option<i64>,
    pub provider_failure_threshold: Option<i32>,
}

impl GlobalConfigPatch {
    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
            crypto_secret_key: self
                .crypto_secret_key
                .ok_or(GlobalConfigError::MissingField("crypto_secret_key"))?,
            credential_cipher_mode: self
                .credential_cipher_mode
                .unwrap_or(super::cipher::CipherMode::Strict),
            session_ttl_ms: self.session_ttl_ms.unwrap_or(3_600_000),
            max_sessions_per_user: self.max_sessions_per_user.unwrap_or(100),
            session_cleanup_interval_ms: self.session_cleanup_interval_ms.unwrap_or(300_000),
            provider_max_concurrent_default: self.provider_max_concurrent_default.unwrap_or(10),
            provider_health_threshold: self.provider_health_threshold.unwrap_or(50),
            provider_cooldown_ms: self.provider_cooldown_ms.unwrap_or(300_000),
            provider_failure_threshold: self.provider_failure_threshold.unwrap_or(5),
        })
    }
}
