use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Self-hosted multi-tenant data platform")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the platform server (default).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Apply platform database migrations and exit.
    Migrate,
    /// Probe the configured backends and report reachability.
    Check,
    /// Print the effective configuration with secrets redacted.
    Config,
}
