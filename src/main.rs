use std::sync::Arc;

use anyhow::Context;
use silentrooms::{
    AppState,
    auth::{AuthClient, Authenticator, WorkspaceAuthorizer},
    bridge::MemoryBroker,
    config::{Config, LogFormat},
    repo::SqliteRepository,
    router,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    info!("silentrooms v{} starting", env!("CARGO_PKG_VERSION"));

    let repo = Arc::new(
        SqliteRepository::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?,
    );

    let (authenticator, authorizer): (Arc<dyn Authenticator>, Arc<dyn WorkspaceAuthorizer>) =
        match &config.auth_url {
            Some(url) => {
                info!(%url, "using external auth service");
                let client = Arc::new(AuthClient::new(url.as_str())?);
                (client.clone(), client)
            }
            None => {
                let auth = Arc::new(config.static_auth()?);
                if auth.allows_everyone() {
                    warn!("STATIC_MEMBERS unset, every user is a member of every workspace");
                }
                (auth.clone(), auth)
            }
        };

    let broker = Arc::new(MemoryBroker::new(config.broker_capacity));
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config, repo, authenticator, authorizer, broker);
    let bridge = state.start_bridge().await?;

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bridge.shutdown().await;
    info!(metrics = ?state.metrics.snapshot(), "shut down");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("silentrooms=info,tower_http=info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().pretty().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
