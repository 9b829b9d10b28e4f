//! BrickBACnet Bridge Framework
//!
//! Common abstractions for building gateways that bridge field protocols into
//! BrickBACnet's metadata and timeseries backends.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, cooperative shutdown, signal handling)
//! - [`BridgeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use brickbacnet_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cli = Cli::parse();
//!     let config = MyBridgeConfig::load(cli.common.config_path("mybridge.json5"))?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&cli.common))?;
//!
//!     // Spawn protocol-specific workers
//!     let token = runner.token();
//!     runner.spawn("worker", my_worker(token));
//!
//!     // Run until the workers finish or Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod runner;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runner::BridgeRunner;

// Re-export commonly used types from brickbacnet-common
pub use brickbacnet_common::{LogFormat, LoggingConfig};
pub use tokio_util::sync::CancellationToken;
