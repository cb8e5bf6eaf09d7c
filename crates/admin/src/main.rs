use mwt_admin::{build_app, AdminConfig};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AdminConfig::from_env()?;
    tracing::debug!(?config, "admin configuration loaded");
    let addr = config.addr;
    let (app, state) = build_app(config)?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr}");
    state.set_ready();

    let shutdown = state.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
