use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use bodega::cli::Cli;
use bodega::http_server::{self, AppState};
use bodega::Store;

#[tokio::main]
async fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bodega=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // Operators who do not pick credentials get throwaway ones, printed
    // so they can actually reach the server.
    let user = cli.user.clone().unwrap_or_else(random_token);
    let pass = cli.pass.clone().unwrap_or_else(random_token);

    let config = cli.store_config();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        compress = config.compress,
        idle_timeout = ?config.idle_timeout,
        "starting bodega"
    );
    tracing::info!(user = %user, pass = %pass, "http basic auth credentials");

    let store = match Store::open(config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        store,
        start_time: Instant::now(),
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    if let Err(e) = http_server::serve(addr, state, Some((user, pass))).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

fn random_token() -> String {
    (0..8).map(|_| fastrand::alphanumeric()).collect()
}
