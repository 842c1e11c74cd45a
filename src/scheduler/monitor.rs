//! Per-target monitor: the failure counter and the remediation trigger.

use crate::config::ProbeSpec;
use crate::probe::Prober;
use crate::remediate::Remediator;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

/// Where a target stands relative to its down-times threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No outstanding failures.
    Healthy,
    /// Some consecutive failures, below the threshold.
    Degraded,
    /// At or past the threshold; remediation is attempted every tick.
    Tripped,
}

impl Health {
    fn of(failures: u32, down_times: u32) -> Self {
        if failures == 0 {
            Health::Healthy
        } else if failures < down_times {
            Health::Degraded
        } else {
            Health::Tripped
        }
    }
}

/// Summary of one tick, mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub probe_ok: bool,
    /// `None` if no remediation was attempted, otherwise whether it succeeded.
    pub remediated: Option<bool>,
    /// Consecutive failure counter after the tick.
    pub failures: u32,
    pub health: Health,
}

#[derive(Debug, Default)]
struct MonitorState {
    failures: u32,
    last_probe_ok: Option<bool>,
    last_success: Option<DateTime<Utc>>,
}

/// Watches one target. Owns its counter; nothing else reads or writes it.
pub struct Monitor {
    spec: Arc<ProbeSpec>,
    prober: Arc<dyn Prober>,
    remediator: Arc<dyn Remediator>,
    verbose: bool,
    state: MonitorState,
}

impl Monitor {
    pub fn new(
        spec: impl Into<Arc<ProbeSpec>>,
        prober: Arc<dyn Prober>,
        remediator: Arc<dyn Remediator>,
        verbose: bool,
    ) -> Self {
        Self {
            spec: spec.into(),
            prober,
            remediator,
            verbose,
            state: MonitorState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn health(&self) -> Health {
        Health::of(self.state.failures, self.spec.down_times)
    }

    /// Run one probe cycle, remediating if the threshold is reached.
    pub async fn tick(&mut self) -> TickReport {
        let result = self.prober.check(&self.spec).await;
        let probe_ok = result.is_ok();

        match result {
            Ok(()) => {
                let recovered_from = self.state.failures;
                self.state.failures = 0;
                self.state.last_success = Some(Utc::now());
                if self.verbose {
                    if recovered_from > 0 {
                        tracing::info!(
                            "server {} probe check success, recovered after {} failures",
                            self.spec.name,
                            recovered_from
                        );
                    } else {
                        tracing::info!("server {} probe check success", self.spec.name);
                    }
                }
            }
            Err(e) => {
                self.state.failures = self.state.failures.saturating_add(1);
                tracing::warn!(
                    "server {} probe check error: {}, counter: {}",
                    self.spec.name,
                    e,
                    self.state.failures
                );
            }
        }
        self.state.last_probe_ok = Some(probe_ok);

        let remediated = if self.state.failures >= self.spec.down_times {
            Some(self.remediate().await)
        } else {
            None
        };

        TickReport {
            probe_ok,
            remediated,
            failures: self.state.failures,
            health: self.health(),
        }
    }

    async fn remediate(&mut self) -> bool {
        let server = &self.spec.server;
        let last_success = self
            .state
            .last_success
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        tracing::warn!(
            "resetting server {} via {} after {} failed checks (last success: {})...",
            self.spec.name,
            server.address(),
            self.state.failures,
            last_success
        );

        match self.remediator.remediate(server).await {
            Ok(output) => {
                tracing::info!("server {} reset output: {}", self.spec.name, output.trim_end());
                self.state.failures = 0;
                true
            }
            Err(e) => {
                if let Some(output) = e.output() {
                    tracing::info!("server {} reset output: {}", self.spec.name, output.trim_end());
                }
                // Counter stays put so the next failing tick retries
                tracing::error!(
                    "resetting server {} error: {}, counter: {}",
                    self.spec.name,
                    e,
                    self.state.failures
                );
                false
            }
        }
    }

    /// Tick every interval until `stop` fires or its sender goes away.
    ///
    /// Stop is only observed between ticks; a probe or remediation already
    /// running is allowed to finish.
    pub async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        tracing::info!(
            "starting server {} probe check ({}, every {:?}, down after {})",
            self.spec.name,
            self.spec.kind,
            self.spec.interval,
            self.spec.down_times
        );

        let period = self.spec.interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    tracing::debug!("server {} tick: {:?}", self.spec.name, report);
                }
            }
        }

        tracing::info!(
            "stopped server {} probe check (last probe ok: {:?})",
            self.spec.name,
            self.state.last_probe_ok
        );
    }
}
