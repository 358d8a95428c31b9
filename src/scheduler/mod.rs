//! Scheduler module for running checks and persisting their outcomes.
//!
//! Every configured check gets its own task. Outcomes travel over an
//! unbounded channel to a single writer task, so a slow database never holds
//! up a probe.

mod cadence;
mod writer;

pub use cadence::*;
pub use writer::*;

use crate::config::{CheckSpec, Config};
use crate::db::Outcome;
use crate::probe::Probe;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type OutcomeSender = mpsc::UnboundedSender<Outcome>;
pub type OutcomeReceiver = mpsc::UnboundedReceiver<Outcome>;

/// Channel between the check loops and the writer.
pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
    mpsc::unbounded_channel()
}

/// Timing settings shared by all check loops.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub max_jitter: Duration,
    pub user_agent: Arc<str>,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.core.interval,
            max_jitter: config.core.jitter,
            user_agent: Arc::from(config.core.user_agent.as_str()),
        }
    }
}

/// Owns one running check loop per configured check.
pub struct Scheduler {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    /// Spawn a check loop for every check in `config`.
    pub fn start<P: Probe>(config: &Config, probe: Arc<P>, tx: OutcomeSender) -> Self {
        let settings = LoopSettings::from_config(config);
        tracing::info!(
            "Starting scheduler with {} checks every {:?}",
            config.checks.len(),
            settings.interval
        );

        let tasks = config
            .checks
            .values()
            .map(|spec| {
                tracing::info!(
                    "Scheduler: Adding check {} ({} {})",
                    spec.name,
                    spec.method,
                    spec.url
                );
                let handle = tokio::spawn(run_check_loop(
                    spec.clone(),
                    settings.clone(),
                    probe.clone(),
                    tx.clone(),
                ));
                (spec.name.clone(), handle)
            })
            .collect();

        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every check loop and wait until they are gone.
    ///
    /// Dropping the loops drops their senders, which lets the writer drain
    /// and exit.
    pub async fn shutdown(self) {
        for (name, task) in self.tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Check loop {} ended abnormally: {}", name, e);
                }
            }
        }
    }
}

/// Probe one check forever on a drift-corrected schedule.
pub async fn run_check_loop<P: Probe>(
    spec: CheckSpec,
    settings: LoopSettings,
    probe: Arc<P>,
    tx: OutcomeSender,
) {
    // Spread the first probes so checks started together do not fire together.
    let jitter = settings.max_jitter.mul_f64(rand::random::<f64>());
    tokio::time::sleep(jitter).await;

    let mut cadence = Cadence::new(Instant::now(), settings.interval);

    loop {
        if cadence.is_due(Instant::now()) {
            cadence.advance();
            let outcome = probe.probe(&spec, &settings.user_agent).await;
            if tx.send(outcome).is_err() {
                tracing::error!("Outcome channel closed, stopping check {}", spec.name);
                return;
            }
        }

        match cadence.wait(Instant::now()) {
            Wait::Sleep(duration) => tokio::time::sleep(duration).await,
            Wait::Behind(slack) => {
                tracing::warn!(
                    "Check {} is falling behind schedule ({:.3}s until due), resynchronizing",
                    spec.name,
                    slack
                );
            }
        }
    }
}
