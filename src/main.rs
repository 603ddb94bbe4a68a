use clap::Parser;
use pacsproxy::config::{Cli, Config};
use pacsproxy::lifecycle::ProxyService;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_args(cli);
    let runtime = pacsproxy::build_runtime(config);

    tracing::info!(
        "✓ pacsproxyd assembled ({} active nodes). Press Ctrl+C to shutdown.",
        runtime.nodes.all().len()
    );

    let service = ProxyService::spawn(runtime);

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c signal");

    tracing::info!("⏳ Shutting down...");
    service.shutdown().await;
}
