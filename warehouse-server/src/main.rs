use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use warehouse::config::Config;

mod api;
mod prometheus;
mod router;
mod server;

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = token.cancelled() => {},
    };

    tracing::info!("Shutting down gracefully...");
    token.cancel();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    // Instantiate tracing outputs:
    //   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let token = CancellationToken::new();
    tokio::spawn(shutdown(token.clone()));

    // Open the TCP port and start the server
    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("could not bind port");

    if let Err(e) = server::serve(config, listener, token).await {
        tracing::error!("warehouse stopped with an error: {:#}", e);
        std::process::exit(1);
    }
    tracing::info!("Shutdown complete");
}
