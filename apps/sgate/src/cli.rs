use clap::Parser;
use sgate_common::{CipherMode, GlobalConfigPatch};

/// CLI/env configuration layer; merged onto defaults as CLI > ENV (§6 Environment configuration).
#[derive(Parser, Debug)]
#[command(name = "sgate", version, about = "Session-matching gateway in front of a session-oriented chat backend")]
pub struct Cli {
    /// Database DSN, e.g. `sqlite://sgate.db?mode=rwc` or a postgres URL.
    #[arg(long, env = "GATEWAY_DSN")]
    pub dsn: Option<String>,

    #[arg(long, env = "GATEWAY_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Optional outbound proxy for upstream egress.
    #[arg(long, env = "GATEWAY_PROXY")]
    pub proxy: Option<String>,

    /// Base64-encoded 32-byte key used by the credential cipher (required).
    #[arg(long, env = "GATEWAY_CRYPTO_SECRET_KEY")]
    pub crypto_secret_key: Option<String>,

    /// `strict` rejects undecryptable legacy rows; `passthrough-on-failure`
    /// returns them unencrypted for backwards compatibility (§9 open question).
    #[arg(long, env = "GATEWAY_CREDENTIAL_CIPHER_MODE")]
    pub credential_cipher_mode: Option<CipherModeArg>,

    #[arg(long, env = "GATEWAY_SESSION_TTL_MS")]
    pub session_ttl_ms: Option<i64>,

    #[arg(long, env = "GATEWAY_MAX_SESSIONS_PER_USER")]
    pub max_sessions_per_user: Option<u32>,

    #[arg(long, env = "GATEWAY_SESSION_CLEANUP_INTERVAL_MS")]
    pub session_cleanup_interval_ms: Option<u64>,

    #[arg(long, env = "GATEWAY_PROVIDER_MAX_CONCURRENT_DEFAULT")]
    pub provider_max_concurrent_default: Option<i32>,

    #[arg(long, env = "GATEWAY_PROVIDER_HEALTH_THRESHOLD")]
    pub provider_health_threshold: Option<i32>,

    #[arg(long, env = "GATEWAY_PROVIDER_COOLDOWN_MS")]
    pub provider_cooldown_ms: Option<i64>,

    #[arg(long, env = "GATEWAY_PROVIDER_FAILURE_THRESHOLD")]
    pub provider_failure_threshold: Option<i32>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CipherModeArg {
    Strict,
    PassthroughOnFailure,
}

impl From<CipherModeArg> for CipherMode {
    fn from(value: CipherModeArg) -> Self {
        match value {
            CipherModeArg::Strict => CipherMode::Strict,
            CipherModeArg::PassthroughOnFailure => CipherMode::PassthroughOnFailure,
        }
    }
}

impl Cli {
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            proxy: self.proxy,
            crypto_secret_key: self.crypto_secret_key,
            credential_cipher_mode: self.credential_cipher_mode.map(CipherMode::from),
            session_ttl_ms: self.session_ttl_ms,
            max_sessions_per_user: self.max_sessions_per_user,
            session_cleanup_interval_ms: self.session_cleanup_interval_ms,
            provider_max_concurrent_default: self.provider_max_concurrent_default,
            provider_health_threshold: self.provider_health_threshold,
            provider_cooldown_ms: self.provider_cooldown_ms,
            provider_failure_threshold: self.provider_failure_threshold,
        }
    }
}
