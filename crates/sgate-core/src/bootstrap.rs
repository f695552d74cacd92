//! Process startup: merge configuration, connect storage, and wire the
//! scheduler/matcher/upstream-client-cache/executor into one [`Bootstrap`]
//! (§9 — explicit objects constructed at boot, no implicit init order).

use std::sync::Arc;

use sgate_common::{AesGcmCipher, CredentialCipher, GlobalConfig};
use sgate_provider::{ProviderScheduler, SchedulerConfig};
use sgate_session::SessionMatcher;
use sgate_storage::{GatewayStorage, SeaOrmStorage};
use sgate_upstream::{UpstreamClientCache, UpstreamClientConfig, WreqClientFactory, WreqServerTokenSource};

use crate::auth::Authenticator;
use crate::core::{Core, CoreConfig};
use crate::handler::GatewayApi;
use crate::maintenance::MaintenanceConfig;

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub scheduler: Arc<ProviderScheduler<SeaOrmStorage>>,
    pub api: Arc<GatewayApi<SeaOrmStorage>>,
    pub maintenance: MaintenanceConfig,
}

/// Connects to the configured DSN, syncs the schema, and assembles the
/// request-serving graph. Does not bind a listener or spawn maintenance
/// tasks — the caller (the `apps/sgate` binary) owns that.
pub async fn bootstrap(global: &GlobalConfig) -> anyhow::Result<Bootstrap> {
    let storage = Arc::new(SeaOrmStorage::connect(&global.dsn).await?);
    storage.sync().await?;

    let cipher: Arc<dyn CredentialCipher> =
        Arc::new(AesGcmCipher::new(&global.crypto_secret_key, global.credential_cipher_mode)?);

    let scheduler_config = SchedulerConfig {
        health_threshold: global.provider_health_threshold,
        failure_threshold: global.provider_failure_threshold,
        cooldown_ms: global.provider_cooldown_ms,
    };
    let scheduler = Arc::new(ProviderScheduler::new(storage.clone(), cipher, scheduler_config));

    let matcher = Arc::new(SessionMatcher::new(
        storage.clone(),
        global.session_ttl_ms,
        global.max_sessions_per_user,
    ));

    let upstream_config = UpstreamClientConfig {
        proxy: global.proxy.clone(),
        ..UpstreamClientConfig::default()
    };
    let token_source = Arc::new(WreqServerTokenSource::new(&upstream_config)?);
    let client_factory = Arc::new(WreqClientFactory {
        config: upstream_config,
        token_source,
    });
    let clients = Arc::new(UpstreamClientCache::new(client_factory));

    let core = Core::new(
        storage.clone(),
        scheduler.clone(),
        matcher,
        clients,
        CoreConfig::default(),
    );
    let auth = Authenticator::new(storage.clone());

    let maintenance = MaintenanceConfig {
        session_cleanup_interval: std::time::Duration::from_millis(
            global.session_cleanup_interval_ms,
        ),
        ..MaintenanceConfig::default()
    };

    Ok(Bootstrap {
        storage,
        scheduler,
        api: Arc::new(GatewayApi { core, auth }),
        maintenance,
    })
}
