use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kh-gateway")]
#[command(about = "Expose an HTTP origin server through a decentralized relay network")]
pub struct Args {
    /// Configuration file (TOML). Command-line flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Origin URL prefix, e.g. http://localhost:3000
    #[arg(short, long)]
    pub destination: Option<String>,

    /// Relay URL; repeat for multiple relays
    #[arg(short, long = "relay")]
    pub relays: Vec<String>,

    /// Route glob pattern; prefix with ! to deny. Repeat for multiple.
    #[arg(short, long = "allow")]
    pub allowed_routes: Vec<String>,

    /// Origin request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Maximum relay hints advertised in the nprofile
    #[arg(long)]
    pub nprofile_max_relays: Option<usize>,

    /// Path to the long-lived secret key file (created if absent)
    #[arg(short = 'k', long)]
    pub secret_key_file: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}
