//! CLI argument parsing for bridges.

use std::path::{Path, PathBuf};

/// Common CLI arguments for all bridges.
///
/// Flatten into a bridge's own `clap` parser:
///
/// ```ignore
/// #[derive(clap::Parser)]
/// struct Cli {
///     #[command(flatten)]
///     common: BridgeArgs,
///     #[command(subcommand)]
///     command: Command,
/// }
/// ```
#[derive(clap::Args, Debug, Clone, Default)]
pub struct BridgeArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl BridgeArgs {
    /// The configured path, or `default` when `--config` was not given.
    pub fn config_path<'a>(&'a self, default: &'a str) -> &'a Path {
        self.config
            .as_deref()
            .unwrap_or_else(|| Path::new(default))
    }
}
