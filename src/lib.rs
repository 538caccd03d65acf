pub mod cli;
pub mod cloud_transcription;
pub mod db;
pub mod export;
pub mod llm_client;
pub mod server;
pub mod settings;
pub mod transcript;

use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("minute")
}

/// Bootstrap the data directory and run the API server until the
/// process is terminated.
pub fn run(args: cli::CliArgs) -> Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    info!("Using data directory {}", data_dir.display());

    let state = Arc::new(
        server::AppState::new(&data_dir)
            .with_context(|| format!("failed to initialize app state in {}", data_dir.display()))?,
    );

    let host = if args.listen_all { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, args.port);

    let worker = server::spawn(addr, state);
    worker.join();
    Ok(())
}
