//! CLI surface (spec.md section 6). Flags that belong to peripheral
//! front ends (SSH, REST/HTML admin, broker stress-test harness) are
//! declared here so a real command line parses, but only the core
//! flags (`config`, `namespace`, `log*`) are read past `main`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "warlink", version, about = "PLC polling gateway with multi-sink republication")]
pub struct Cli {
    /// Path to the namespace/plcs/sinks configuration file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Overrides the config file's namespace (must match ^[A-Za-z0-9._-]+$).
    #[arg(long)]
    pub namespace: Option<String>,

    /// Disable the interactive TUI and log to stdout instead.
    #[arg(short = 'd', long = "no-tui")]
    pub no_tui: bool,

    /// Write logs to this file instead of stdout.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Enable debug logging, optionally scoped to a `tracing` filter directive.
    #[arg(long = "log-debug", value_name = "FILTER", num_args = 0..=1, default_missing_value = "debug")]
    pub log_debug: Option<String>,

    /// REST/HTML admin surface bind port (peripheral, unused by the core).
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// REST/HTML admin surface bind host (peripheral, unused by the core).
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long = "admin-user")]
    pub admin_user: Option<String>,

    #[arg(long = "admin-pass")]
    pub admin_pass: Option<String>,

    #[arg(long = "ssh-port")]
    pub ssh_port: Option<u16>,

    #[arg(long = "ssh-pass")]
    pub ssh_pass: Option<String>,

    #[arg(long = "ssh-keys")]
    pub ssh_keys: Option<PathBuf>,

    /// Disable the REST/HTML admin surface entirely.
    #[arg(long = "no-api")]
    pub no_api: bool,

    /// Disable the web UI (implies --no-api is not required, served separately).
    #[arg(long = "no-webui")]
    pub no_webui: bool,

    /// Run the broker stress-test harness instead of the gateway (peripheral).
    #[arg(long = "stress-test")]
    pub stress_test: bool,

    #[arg(long = "stress-test-tags")]
    pub stress_test_tags: Option<usize>,

    #[arg(long = "stress-test-rate-ms")]
    pub stress_test_rate_ms: Option<u64>,
}
