//! Discovery pipeline — spec §4.1.
//!
//! Every source exposes the same capability set behind [`DiscoverySource`].
//! Grounded on the teacher's domain-trait style: a small set of `impl`
//! blocks on a shared struct (`DockerClient` in
//! `crates/agent/src/docker/{client,container,event}.rs`), generalized
//! here into an actual trait so the multi-source aggregator (`multi.rs`)
//! can hold heterogeneous sources behind one type.

pub mod cluster_api;
pub mod container_runtime;
pub mod multi;
pub mod static_file;

use thiserror::Error;
use tokio::sync::watch;

use crate::service::{ChangeListenerTarget, Service};

/// Advisory health-check type & args returned by [`DiscoverySource::health_check`].
///
/// An empty `check_type` means "no opinion" — the monitor falls back to
/// its own default behavior (spec §4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckAdvice {
    pub check_type: String,
    pub args: String,
}

impl HealthCheckAdvice {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.check_type.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid source configuration: {0}")]
    Config(String),
    #[error("transient source error: {0}")]
    Transient(String),
}

/// The capability every discovery source implements (spec §4.1).
///
/// `services`/`health_check`/`listeners` are synchronous snapshot reads —
/// each source is responsible for keeping its own internal state current
/// via its `run` background work and handing back value copies so callers
/// never observe a torn write (spec §8: "no partial entries are
/// observed").
pub trait DiscoverySource: Send + Sync {
    /// Snapshot of currently known services.
    fn services(&self) -> Vec<Service>;

    /// Advisory check type & args for `svc`, or [`HealthCheckAdvice::none`]
    /// when this source has no opinion.
    fn health_check(&self, svc: &Service) -> HealthCheckAdvice;

    /// Local change-event subscribers this source wants registered with
    /// the catalog (spec §3 `ChangeListener`).
    fn listeners(&self) -> Vec<ChangeListenerTarget>;

    /// Start this source's background work. Must return promptly; actual
    /// work happens in tasks spawned here, each built around a
    /// [`crate::looper::ForeverLooper`] bound to `quit_rx` so that
    /// cancellation is communicated through the injected scheduler rather
    /// than ad hoc flags (spec §4.1, §5 "Cancellation").
    fn run(&self, quit_rx: watch::Receiver<bool>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_advice_none_is_empty() {
        let advice = HealthCheckAdvice::none();
        assert!(advice.is_none());
        assert_eq!(advice.check_type, "");
        assert_eq!(advice.args, "");
    }

    #[test]
    fn health_check_advice_with_type_is_not_none() {
        let advice = HealthCheckAdvice {
            check_type: "HttpGet".to_string(),
            args: "http://x".to_string(),
        };
        assert!(!advice.is_none());
    }
}
