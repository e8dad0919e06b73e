mod config;
mod lock;
mod state;
mod supervisor;
mod tls;
mod tunnel;

use std::process::ExitCode;

use clap::Parser;

use config::ClientArgs;

#[tokio::main]
async fn main() -> ExitCode {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("failed to install rustls CryptoProvider");
        return ExitCode::from(supervisor::EXIT_TLS as u8);
    }

    let args = ClientArgs::parse();
    init_tracing(&args);

    let code = supervisor::run(args).await;
    ExitCode::from(code as u8)
}

fn init_tracing(args: &ClientArgs) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if args.log_json {
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
