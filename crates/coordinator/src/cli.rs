//! Command line interface of the coordinator binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "mixnet-coordinator", version, about = "Mixnet permissioning server")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "coordinator.toml")]
    pub config: PathBuf,

    /// Log filter, e.g. "info" or "mixnet_coordinator=debug".
    /// RUST_LOG takes precedence when set.
    #[arg(long)]
    pub log_filter: Option<String>,
}
