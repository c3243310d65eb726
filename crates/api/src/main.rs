use std::sync::Arc;

use anyhow::Context;

use recap_api::app::{build_app, config::ApiConfig, services::build_services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    recap_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(build_services(&config).await?);
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
