//! Process entry point: parse CLI/env config, bootstrap the request-serving
//! graph, spawn maintenance loops, and serve the Gemini-compatible surface.

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let global = cli.into_patch().into_config()?;

    let boot = sgate_core::bootstrap::bootstrap(&global).await?;

    sgate_core::spawn_maintenance_tasks(
        boot.storage.clone(),
        boot.scheduler.clone(),
        boot.maintenance,
    );

    let app = sgate_core::router(boot.api.clone());

    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
