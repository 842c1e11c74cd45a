//! Scheduler module: one monitor task per target and their shared shutdown.

mod monitor;

pub use monitor::*;

use crate::config::ProbeSpec;
use crate::probe::Prober;
use crate::remediate::Remediator;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Starts the monitors and stops them all at once.
pub struct Supervisor {
    stop_tx: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            stop_tx,
            tasks: Vec::new(),
        }
    }

    /// Spawn one monitor per spec, all sharing the same prober and remediator.
    pub fn start(
        specs: Vec<ProbeSpec>,
        prober: Arc<dyn Prober>,
        remediator: Arc<dyn Remediator>,
        verbose: bool,
    ) -> Self {
        let mut supervisor = Self::new();
        tracing::info!("Starting supervisor with {} probes", specs.len());

        for spec in specs {
            supervisor.spawn(Monitor::new(
                spec,
                prober.clone(),
                remediator.clone(),
                verbose,
            ));
        }
        supervisor
    }

    /// Run a monitor as its own task.
    pub fn spawn(&mut self, monitor: Monitor) {
        let name = monitor.name().to_string();
        let stop_rx = self.stop_tx.subscribe();
        self.tasks.push((name, tokio::spawn(monitor.run(stop_rx))));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Tell every monitor to stop after its current tick.
    pub fn shutdown(&self) {
        tracing::info!("Supervisor: stopping {} monitors", self.tasks.len());
        // No receivers left just means every monitor already exited
        let _ = self.stop_tx.send(());
    }

    /// Wait up to `grace` for the monitors to exit. Returns how many were
    /// still running when time ran out.
    pub async fn join(self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let mut unfinished = 0;

        for (name, handle) in self.tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("monitor {} task failed: {}", name, e),
                Err(_) => {
                    tracing::warn!("monitor {} did not stop within {:?}", name, grace);
                    unfinished += 1;
                }
            }
        }

        unfinished
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
