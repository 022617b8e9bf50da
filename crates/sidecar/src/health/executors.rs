//! Check executors — spec §4.5.
//!
//! Grounded on the HTTP-status-to-health mapping in
//! `crates/agent/src/health/route.rs::evaluate_health`, generalized from a
//! single fixed source (metrics snapshot) to an arbitrary target string
//! (`Args`) per executor kind.

use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use super::CheckOutcome;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("empty command")]
    EmptyCommand,
}

/// A pluggable mechanism for determining whether a service is reachable.
pub trait CheckExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        args: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CheckOutcome> + Send + 'a>>;
}

/// Issues an HTTP GET against `args` (the full URL).
pub struct HttpGetExecutor {
    client: reqwest::Client,
}

impl HttpGetExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGetExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckExecutor for HttpGetExecutor {
    fn execute<'a>(
        &'a self,
        args: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CheckOutcome> + Send + 'a>> {
        Box::pin(async move {
            match self.client.get(args).send().await {
                Ok(resp) if resp.status().is_success() => CheckOutcome::Healthy,
                Ok(resp) => CheckOutcome::Sickly {
                    message: format!("http status {}", resp.status()),
                },
                Err(e) => CheckOutcome::Unknown {
                    message: e.to_string(),
                },
            }
        })
    }
}

/// Runs `args` (split on spaces) as an external command, no shell.
pub struct ExternalExecutor;

impl CheckExecutor for ExternalExecutor {
    fn execute<'a>(
        &'a self,
        args: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CheckOutcome> + Send + 'a>> {
        Box::pin(async move {
            let mut parts = args.split_whitespace();
            let Some(program) = parts.next() else {
                return CheckOutcome::Unknown {
                    message: ExecutorError::EmptyCommand.to_string(),
                };
            };
            let rest: Vec<&str> = parts.collect();

            match Command::new(program).args(&rest).output().await {
                Ok(output) if output.status.success() => CheckOutcome::Healthy,
                Ok(output) => {
                    let combined = format!(
                        "{}{}",
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr)
                    );
                    warn!("external check failed: {}", combined);
                    CheckOutcome::Sickly { message: combined }
                }
                Err(e) => CheckOutcome::Unknown {
                    message: e.to_string(),
                },
            }
        })
    }
}

/// Trivially always healthy.
pub struct AlwaysSuccessfulExecutor;

impl CheckExecutor for AlwaysSuccessfulExecutor {
    fn execute<'a>(
        &'a self,
        _args: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CheckOutcome> + Send + 'a>> {
        Box::pin(async move { CheckOutcome::Healthy })
    }
}

/// Resolve an executor by name, defaulting to [`HttpGetExecutor`] for any
/// unrecognized name (spec §4.5).
pub fn executor_for(name: &str) -> Box<dyn CheckExecutor> {
    match name {
        "External" => Box::new(ExternalExecutor),
        "AlwaysSuccessful" => Box::new(AlwaysSuccessfulExecutor),
        _ => Box::new(HttpGetExecutor::new()),
    }
}
