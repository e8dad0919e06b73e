mod app;
mod auth;
mod buffers;
mod config;
mod error;
mod limits;
mod raw;
mod router;
mod routes;
mod rpc;
mod session;
mod state;
mod tls;

use clap::Parser;

use config::EdgeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let config = EdgeConfig::parse();
    init_tracing(&config);
    app::run(config).await
}

fn init_tracing(config: &EdgeConfig) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
