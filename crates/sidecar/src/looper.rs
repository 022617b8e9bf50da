//! Scheduling abstraction extracted out of the components it drives.
//!
//! Every long-running task in this crate (a discovery source's `Run`, the
//! health monitor's main loop, the watcher/reconciler, the snapshotter's
//! update loop) is driven by a [`Looper`] rather than hand-rolling its own
//! `tokio::select!` — this is what lets tests run exactly one iteration
//! with [`FreeLooper`] instead of racing a background task.
//!
//! Grounded on the `watch::Receiver<bool>` + `tokio::select!` idiom used
//! throughout `crates/cluster/src/agent/registry.rs` and
//! `crates/cluster/src/agent/discovery.rs` in the teacher, lifted into a
//! reusable type.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Drives a repeatable async step function with controlled termination.
pub trait Looper: Send {
    /// Run `step` according to this looper's schedule until it decides to
    /// stop (either its own termination condition, or an external `quit`).
    async fn run<F, Fut>(&mut self, step: F)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send;
}

/// Runs exactly `n` iterations back-to-back, no delay between them.
///
/// Used in tests to execute a deterministic number of steps, e.g.
/// `FreeLooper::new(1)` to run one health-check tick.
pub struct FreeLooper {
    remaining: usize,
}

impl FreeLooper {
    pub fn new(n: usize) -> Self {
        Self { remaining: n }
    }
}

impl Looper for FreeLooper {
    async fn run<F, Fut>(&mut self, step: F)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        while self.remaining > 0 {
            step().await;
            self.remaining -= 1;
        }
    }
}

/// Runs `n` iterations spaced `interval` apart.
pub struct TimedLooper {
    remaining: usize,
    interval: Duration,
}

impl TimedLooper {
    pub fn new(n: usize, interval: Duration) -> Self {
        Self {
            remaining: n,
            interval,
        }
    }
}

impl Looper for TimedLooper {
    async fn run<F, Fut>(&mut self, step: F)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while self.remaining > 0 {
            ticker.tick().await;
            step().await;
            self.remaining -= 1;
        }
    }
}

/// Runs forever, spaced `interval` apart, until [`Quit::quit`] is called on
/// its paired [`Quit`] handle.
pub struct ForeverLooper {
    interval: Duration,
    quit_rx: watch::Receiver<bool>,
}

/// Handle used to request shutdown of a [`ForeverLooper`] (or to cascade
/// shutdown to children, as the multi-source aggregator does — spec §9).
#[derive(Clone)]
pub struct Quit {
    tx: watch::Sender<bool>,
}

impl Quit {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ForeverLooper {
    /// Build a looper/quit-handle pair spaced `interval` apart.
    pub fn new(interval: Duration) -> (Self, Quit) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                interval,
                quit_rx: rx,
            },
            Quit { tx },
        )
    }

    /// Build a looper bound to an externally-owned quit receiver (used when
    /// several loopers must all stop on the same shutdown signal, as in
    /// `main.rs`'s `Ctrl+C` handling).
    pub fn with_receiver(interval: Duration, quit_rx: watch::Receiver<bool>) -> Self {
        Self { interval, quit_rx }
    }
}

impl Looper for ForeverLooper {
    async fn run<F, Fut>(&mut self, step: F)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    step().await;
                }
                _ = self.quit_rx.changed() => {
                    if *self.quit_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn free_looper_runs_exactly_n_steps() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut looper = FreeLooper::new(3);
        let c = count.clone();
        looper.run(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn forever_looper_stops_on_quit() {
        let count = Arc::new(AtomicUsize::new(0));
        let (mut looper, quit) = ForeverLooper::new(Duration::from_millis(1));
        let c = count.clone();
        let handle = tokio::spawn(async move {
            looper.run(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        quit.trigger();
        handle.await.expect("looper task panicked");

        assert!(count.load(Ordering::SeqCst) > 0);
    }
}
