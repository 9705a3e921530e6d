//! Readiness Gate
//!
//! Blocks startup until local preconditions hold:
//! - Each condition is polled at its own interval up to its own timeout
//! - `Required` conditions fail the gate immediately on timeout
//! - `Advisory` conditions log a warning on timeout and let startup continue
//!
//! Probes only inspect state (mount tables, sockets, process tables); they
//! never change it, so polling them repeatedly is always safe.

pub mod probes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::logging::OutcomeLog;

pub use probes::{DisplayProbe, FnProbe, NetworkProbe, TcpProbe};

/// Read-only predicate polled by the gate
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// A condition that never became true within its timeout
#[derive(Debug, Clone, PartialEq, Error)]
#[error("readiness condition '{condition_name}' not satisfied after {elapsed_seconds:.1}s")]
pub struct ReadinessError {
    pub condition_name: String,
    pub elapsed_seconds: f64,
}

/// How a timeout of this condition affects the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionMode {
    /// Fail the whole gate on timeout
    Required,
    /// Warn and carry on
    Advisory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionState {
    Pending,
    Satisfied(DateTime<Utc>),
    Failed { elapsed: Duration },
}

pub struct ReadinessCondition {
    name: String,
    probe: Arc<dyn Probe>,
    timeout: Duration,
    poll_interval: Duration,
    mode: ConditionMode,
    state: ConditionState,
}

impl fmt::Debug for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessCondition")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

impl ReadinessCondition {
    pub fn new(
        name: impl Into<String>,
        probe: Arc<dyn Probe>,
        timeout: Duration,
        poll_interval: Duration,
        mode: ConditionMode,
    ) -> Self {
        Self {
            name: name.into(),
            probe,
            timeout,
            // a zero interval would spin the runtime
            poll_interval: poll_interval.max(Duration::from_millis(10)),
            mode,
            state: ConditionState::Pending,
        }
    }

    pub fn required(
        name: impl Into<String>,
        probe: Arc<dyn Probe>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self::new(name, probe, timeout, poll_interval, ConditionMode::Required)
    }

    pub fn advisory(
        name: impl Into<String>,
        probe: Arc<dyn Probe>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self::new(name, probe, timeout, poll_interval, ConditionMode::Advisory)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ConditionMode {
        self.mode
    }

    pub fn state(&self) -> &ConditionState {
        &self.state
    }

    /// Poll until satisfied or timed out. A satisfied condition is not
    /// polled again.
    async fn wait(&mut self) -> Result<DateTime<Utc>, ReadinessError> {
        if let ConditionState::Satisfied(at) = self.state {
            return Ok(at);
        }

        let started = Instant::now();
        loop {
            if self.probe.check().await {
                let at = Utc::now();
                self.state = ConditionState::Satisfied(at);
                return Ok(at);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                self.state = ConditionState::Failed { elapsed };
                return Err(ReadinessError {
                    condition_name: self.name.clone(),
                    elapsed_seconds: elapsed.as_secs_f64(),
                });
            }

            sleep(self.poll_interval.min(self.timeout - elapsed)).await;
        }
    }
}

/// When and after how long a condition was satisfied
#[derive(Debug, Clone, PartialEq)]
pub struct SatisfiedCondition {
    pub name: String,
    pub satisfied_at: DateTime<Utc>,
}

/// Outcome of a passed gate
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub satisfied: Vec<SatisfiedCondition>,
    /// Advisory conditions that timed out
    pub skipped: Vec<ReadinessError>,
}

impl GateReport {
    pub fn satisfied_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.satisfied
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.satisfied_at)
    }

    pub fn was_skipped(&self, name: &str) -> bool {
        self.skipped.iter().any(|e| e.condition_name == name)
    }
}

/// Ordered set of readiness conditions, evaluated one after another
#[derive(Debug)]
pub struct ReadinessGate {
    conditions: Vec<ReadinessCondition>,
    log: OutcomeLog,
}

impl ReadinessGate {
    pub fn new(log: OutcomeLog) -> Self {
        Self {
            conditions: Vec::new(),
            log,
        }
    }

    pub fn with(mut self, condition: ReadinessCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn push(&mut self, condition: ReadinessCondition) {
        self.conditions.push(condition);
    }

    pub fn conditions(&self) -> &[ReadinessCondition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Block until every condition is satisfied or a required one fails
    pub async fn wait_all(&mut self) -> Result<GateReport, ReadinessError> {
        let mut report = GateReport::default();

        for condition in self.conditions.iter_mut() {
            if condition.state == ConditionState::Pending {
                self.log.started(format!(
                    "waiting for '{}' (timeout {:?})",
                    condition.name, condition.timeout
                ));
            }

            match condition.wait().await {
                Ok(at) => {
                    self.log.succeeded(format!("'{}' satisfied at {}", condition.name, at));
                    report.satisfied.push(SatisfiedCondition {
                        name: condition.name.clone(),
                        satisfied_at: at,
                    });
                }
                Err(e) if condition.mode == ConditionMode::Advisory => {
                    self.log.warned(format!("{}; continuing without it", e));
                    report.skipped.push(e);
                }
                Err(e) => {
                    self.log.failed(&e);
                    return Err(e);
                }
            }
        }

        Ok(report)
    }
}
