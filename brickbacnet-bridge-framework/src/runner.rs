//! Bridge runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use brickbacnet_common::init_tracing;

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Default time workers get to observe cancellation before being aborted.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Handles:
/// - Logging initialization
/// - Task spawning and management
/// - Cooperative shutdown on Ctrl+C / SIGTERM through a [`CancellationToken`]
///
/// # Example
///
/// ```ignore
/// let config = MyBridgeConfig::load(args.config_path("mybridge.json5"))?;
/// let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
///
/// let token = runner.token();
/// runner.spawn("poller", async move { poll_forever(token).await });
///
/// runner.run().await?;
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Cancellation signal shared with every worker.
    token: CancellationToken,
    /// Spawned workers.
    tasks: JoinSet<(String, std::result::Result<(), String>)>,
    /// Grace period after cancellation.
    shutdown_timeout: Duration,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner, initializing logging from the config.
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None)
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let level_override = args.and_then(|a| a.log_level.as_deref());
        let log_config = config.logging().with_level_override(level_override);

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        Ok(Self {
            name,
            version,
            config,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// Set the grace period workers get after cancellation.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the cancellation token handed to workers.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a named worker task.
    ///
    /// Errors are logged and reported by [`run`](Self::run).
    pub fn spawn<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        self.tasks.spawn(async move {
            let result = future.await.map_err(|e| e.to_string());
            (name, result)
        });
    }

    /// Run the bridge until every worker finishes, one fails, or a shutdown
    /// signal arrives.
    ///
    /// The cancellation token is then fired and workers get the
    /// shutdown grace period to return; stragglers are aborted. Returns a
    /// [`BridgeError::Worker`] if any worker failed.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            bridge = %self.name,
            workers = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        let mut failures = Vec::new();
        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    tracing::info!(bridge = %self.name, "Received shutdown signal");
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(outcome) => {
                        if !record_outcome(outcome, &mut failures) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.token.cancel();

        let drain = async {
            while let Some(outcome) = self.tasks.join_next().await {
                let _ = record_outcome(outcome, &mut failures);
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(
                bridge = %self.name,
                remaining = self.tasks.len(),
                "Workers did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::worker(failures.join("; ")))
        }
    }
}

/// Log a finished worker. Returns `false` if it failed.
fn record_outcome(
    outcome: std::result::Result<(String, std::result::Result<(), String>), tokio::task::JoinError>,
    failures: &mut Vec<String>,
) -> bool {
    match outcome {
        Ok((name, Ok(()))) => {
            tracing::debug!(worker = %name, "Worker finished");
            true
        }
        Ok((name, Err(e))) => {
            tracing::error!(worker = %name, error = %e, "Worker failed");
            failures.push(format!("{}: {}", name, e));
            false
        }
        Err(e) if e.is_cancelled() => true,
        Err(e) => {
            tracing::error!(error = %e, "Worker panicked");
            failures.push(e.to_string());
            false
        }
    }
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to set up SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoggingConfig;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    fn runner() -> BridgeRunner<TestConfig> {
        let config = TestConfig {
            logging: LoggingConfig::default(),
        };
        BridgeRunner {
            name: "test".to_string(),
            version: "0.0.0".to_string(),
            config,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            shutdown_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_run_returns_when_workers_finish() {
        let mut runner = runner();
        runner.spawn("one", async { Ok::<(), String>(()) });
        runner.spawn("two", async { Ok::<(), String>(()) });

        assert!(runner.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_worker_failure_is_reported() {
        let mut runner = runner();
        runner.spawn("broken", async { Err::<(), _>("device unreachable") });

        match runner.run().await {
            Err(BridgeError::Worker(msg)) => assert!(msg.contains("broken: device unreachable")),
            other => panic!("expected worker error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_worker_cancels_siblings() {
        let mut runner = runner();
        let token = runner.token();
        runner.spawn("waiter", async move {
            token.cancelled().await;
            Ok::<(), String>(())
        });
        runner.spawn("broken", async { Err::<(), _>("boom") });

        let result = tokio::time::timeout(Duration::from_secs(2), runner.run()).await;
        assert!(matches!(result, Ok(Err(BridgeError::Worker(_)))));
    }
}
