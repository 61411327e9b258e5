use clap::{Parser, Subcommand};
use roomies_shared::domain::Period;

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5252 or config.listen_port)
  RUST_LOG    (default: info)

The report commands read the same database and config as the server.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "roomies-server",
    version,
    about = "Roomies engagement server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a household leaderboard as JSON
    Leaderboard {
        /// Household id
        household: String,
        /// week, month or all_time
        #[arg(long, default_value_t = Period::Week)]
        period: Period,
    },
    /// Print a household analytics snapshot as JSON
    Analytics {
        /// Household id
        household: String,
    },
}
