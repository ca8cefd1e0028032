// ===============================
// src/main.rs
// ===============================

use mmbot::config::Config;
use mmbot::metrics;
use mmbot::supervisor::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mmbot=info".into()),
        )
        .init();

    // Optional config document path; environment always overrides it.
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(1);
        }
    };

    metrics::init();
    metrics::serve_metrics(config.metrics_port);

    info!(
        exchange = %config.exchange,
        testnet = config.use_testnet,
        symbol = %config.symbol,
        spread = config.spread,
        order_size = %config.order_size,
        ws_trading = config.use_websocket_trading,
        api_key = %config.masked_key(),
        "startup config"
    );

    let supervisor = match Supervisor::new(config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "initialization failed");
            return ExitCode::from(1);
        }
    };

    // Termination signal flips the running flag; the run loop unwinds.
    let signal_target = Arc::clone(&supervisor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            signal_target.begin_shutdown();
        }
    });

    if let Err(e) = supervisor.run().await {
        error!(error = %e, "runtime failure");
    }

    info!("stopped");
    ExitCode::SUCCESS
}
