use std::{net::SocketAddr, sync::Arc};

use webhook_replay::{
    api,
    config::AppConfig,
    db::{self, pg::PgLedger},
    replay,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_replay=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env().map_err(|err| anyhow::anyhow!("invalid config: {err}"))?;
    let pool = db::connect_with(&config.database_url, config.database_max_connections).await?;
    db::run_migrations(&pool).await?;

    let app = api::router(api::AppState::new(
        Arc::new(PgLedger::new(pool)),
        replay::client_builder(config.service.dev_mode).build()?,
        config.service.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        dev_mode = config.service.dev_mode,
        "server listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
