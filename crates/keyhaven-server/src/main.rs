use std::sync::Arc;

use keyhaven_server::server_state::ServerState;
use keyhaven_server::{config, db, ipc, ServerError};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "keyhaven-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    tracing::info!("keyhaven-server starting");
    let config = config::parse_args(std::env::args().skip(1))?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = db::open_server_db(&config.db_path)?;
    let state = Arc::new(ServerState::new(db, config.keys.clone()));

    let listener = ipc::bind_ipc_socket(&config.socket_path)?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    tokio::spawn(ipc::serve(listener, Arc::clone(&state), shutdown_tx));

    tracing::info!(
        socket = %config.socket_path.display(),
        db = %config.db_path.display(),
        "keyhaven-server ready"
    );

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
    }

    tracing::info!("keyhaven-server shutting down");
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}
