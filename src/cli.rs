use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "minute", about = "Minute - meeting recorder and minutes generator")]
pub struct CliArgs {
    /// Port for the local API server
    #[arg(long, env = "PORT", default_value_t = 13001)]
    pub port: u16,

    /// Directory holding the database and uploaded audio
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Bind to all interfaces instead of loopback only
    #[arg(long)]
    pub listen_all: bool,
}
