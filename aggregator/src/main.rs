use envconfig::Envconfig;
use tokio::signal;

use aggregator::config::Config;
use aggregator::server::serve;

/// Wait for SIGTERM or SIGINT.
async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .expect("failed to bind listener");

    serve(config, listener, shutdown()).await;
}
