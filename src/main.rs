//! saga_transfer - account and transfer services in one process
//!
//! ```text
//! POST /api/v1/transfers ──▶ transfers + transfer_outbox ──▶ transfer-out-0
//!                                                               │
//!        saga state machine ◀── account-out-0 ◀── accounts + account_outbox
//! ```
//!
//! Usage: `saga_transfer [--env dev] [--port 8080]`

use saga_transfer::config::AppConfig;
use saga_transfer::logging::init_logging;
use saga_transfer::runtime;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let mut config = AppConfig::load(&env)?;
    if let Some(port) = get_port_override() {
        config.server.port = port;
    }

    let _log_guard = init_logging(&config)?;
    tracing::info!(env = %env, port = config.server.port, "Starting saga_transfer");

    if let Err(e) = runtime::run(config).await {
        tracing::error!("Fatal: {:#}", e);
        return Err(e);
    }
    Ok(())
}
