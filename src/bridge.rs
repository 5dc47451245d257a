//! Bridge Loop: one serialized reconciliation worker per emulator target.
//!
//! A cycle reads the signal, perceives, decides, executes, verifies and
//! records. Every per-cycle fault ends that cycle only; the loop keeps
//! ticking until told to stop, and a stop request waits for the cycle in
//! flight.

use crate::error::BridgeError;
use crate::executor::ActionExecutor;
use crate::history::{ExecutionHistory, HistoryLookup};
use crate::model::{DesiredAction, IntentKind, NoActionReason, Observation, Outcome};
use crate::perception::Perceiver;
use crate::profile::AppProfile;
use crate::reconciler::{reconcile, settled, Thresholds};
use crate::signal::SignalReader;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What the signal store yielded this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Present,
    Absent,
    Malformed,
    Stale,
    Unreadable,
}

/// Structured summary of one cycle, emitted as a single event.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub device: String,
    pub signal: SignalStatus,
    pub sequence_id: Option<String>,
    pub perception_source: Option<&'static str>,
    pub confidence: Option<f32>,
    pub decision: Option<IntentKind>,
    pub reason: Option<NoActionReason>,
    pub outcome: Option<Outcome>,
    pub attempt_count: Option<u32>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(device: &str, signal: SignalStatus) -> Self {
        Self {
            device: device.to_string(),
            signal,
            sequence_id: None,
            perception_source: None,
            confidence: None,
            decision: None,
            reason: None,
            outcome: None,
            attempt_count: None,
            error: None,
            error_kind: None,
            duration_ms: 0,
        }
    }

    fn fail(&mut self, e: &BridgeError) {
        self.error = Some(e.to_string());
        self.error_kind = Some(e.kind());
    }

    pub fn emit(&self) {
        info!(
            target: "signal_bridge::cycle",
            device = %self.device,
            signal = ?self.signal,
            sequence_id = self.sequence_id.as_deref().unwrap_or("-"),
            source = self.perception_source.unwrap_or("-"),
            confidence = self.confidence.unwrap_or(0.0),
            decision = ?self.decision,
            reason = ?self.reason,
            outcome = self.outcome.map(|o| o.as_str()).unwrap_or("-"),
            attempts = self.attempt_count.unwrap_or(0),
            error_kind = self.error_kind.unwrap_or("-"),
            error = self.error.as_deref().unwrap_or(""),
            duration_ms = self.duration_ms,
            "cycle complete"
        );
    }
}

pub struct BridgeLoop {
    device: String,
    signals: Arc<SignalReader>,
    perceiver: Arc<Perceiver>,
    executor: ActionExecutor,
    history: ExecutionHistory,
    profile: Arc<AppProfile>,
    thresholds: Thresholds,
    poll_interval: Duration,
    cycle_timeout: Duration,
}

impl BridgeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &str,
        signals: Arc<SignalReader>,
        perceiver: Arc<Perceiver>,
        executor: ActionExecutor,
        history: ExecutionHistory,
        profile: Arc<AppProfile>,
        thresholds: Thresholds,
        poll_interval: Duration,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            device: device.to_string(),
            signals,
            perceiver,
            executor,
            history,
            profile,
            thresholds,
            poll_interval,
            cycle_timeout,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Tick until `stop` flips to true (or its sender is dropped). A cycle
    /// already running always finishes first.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device = %self.device, interval_ms = self.poll_interval.as_millis() as u64, "bridge loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *stop.borrow() {
                break;
            }
            self.run_cycle().await.emit();
        }

        info!(device = %self.device, "bridge loop stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let mut report = self.cycle(started).await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn cycle(&mut self, started: Instant) -> CycleReport {
        let desired = match self.signals.read() {
            Ok(Some(d)) => d,
            Ok(None) => return CycleReport::new(&self.device, SignalStatus::Absent),
            Err(e) => {
                let status = match &e {
                    BridgeError::MalformedSignal(_) => {
                        warn!(device = %self.device, error = %e, "signal unreadable, treating as absent");
                        SignalStatus::Malformed
                    }
                    BridgeError::StaleSignal { .. } => {
                        debug!(device = %self.device, error = %e, "ignoring stale signal");
                        SignalStatus::Stale
                    }
                    _ => {
                        warn!(device = %self.device, error = %e, "signal store read failed");
                        SignalStatus::Unreadable
                    }
                };
                let mut report = CycleReport::new(&self.device, status);
                report.fail(&e);
                return report;
            }
        };

        let mut report = CycleReport::new(&self.device, SignalStatus::Present);
        report.sequence_id = Some(desired.sequence_id.to_string());
        report.attempt_count = self.history.get(&desired.sequence_id).map(|r| r.attempt_count);

        if let Some(done) = settled(&desired, &self.history, &self.thresholds) {
            report.decision = Some(done.kind);
            report.reason = done.reason;
            return report;
        }

        // Perception and decision are abandoned past the cycle deadline;
        // execution below is not.
        let budget = self.cycle_timeout.saturating_sub(started.elapsed());
        let decided = tokio::time::timeout(budget, async {
            let (observation, layout) = self.perceiver.observe(&self.device).await;
            let intent = reconcile(&desired, &observation, &self.history, &self.thresholds, &self.profile);
            (observation, layout, intent)
        })
        .await;
        let (observation, layout, intent) = match decided {
            Ok(d) => d,
            Err(_) => {
                let e = BridgeError::Timeout(format!("perception exceeded {}ms", budget.as_millis()));
                warn!(device = %self.device, sequence_id = %desired.sequence_id, error = %e, "cycle abandoned");
                report.fail(&e);
                return report;
            }
        };

        if let Observation::Screen(s) = &observation {
            report.perception_source = Some(s.perception_source.as_str());
            report.confidence = Some(s.confidence);
        }
        report.decision = Some(intent.kind);
        report.reason = intent.reason;

        if intent.is_none() {
            match intent.reason {
                Some(NoActionReason::AlreadySatisfied) => {
                    self.record(&desired, Outcome::SkippedAlreadySatisfied, &mut report);
                }
                Some(NoActionReason::PerceptionInsufficient) => {
                    let reasons = match &observation {
                        Observation::Unusable(u) => {
                            u.iter().map(|x| format!("{}: {}", x.source.as_str(), x.reason)).collect::<Vec<_>>().join("; ")
                        }
                        Observation::Screen(s) => format!("confidence {:.2} below threshold", s.confidence),
                    };
                    report.fail(&BridgeError::PerceptionInsufficient(reasons));
                }
                _ => {}
            }
            return report;
        }

        info!(
            device = %self.device,
            sequence_id = %desired.sequence_id,
            kind = ?intent.kind,
            intent_target = ?intent.target,
            steps = intent.steps.len(),
            "executing intent"
        );
        let executed = self.executor.execute(&self.device, &intent, layout).await;
        report.outcome = Some(executed.outcome);
        if let Some(e) = &executed.error {
            report.fail(e);
        }

        // Dismissals clear the way; they say nothing about the signal itself.
        if intent.kind != IntentKind::DismissDialog {
            self.record(&desired, executed.outcome, &mut report);
        }
        report
    }

    fn record(&mut self, desired: &DesiredAction, outcome: Outcome, report: &mut CycleReport) {
        match self.history.record(&desired.sequence_id, outcome, Utc::now()) {
            Ok(rec) => {
                report.outcome = Some(rec.outcome);
                report.attempt_count = Some(rec.attempt_count);
            }
            Err(e) => {
                error!(device = %self.device, sequence_id = %desired.sequence_id, error = %e, "failed to persist execution record");
                report.fail(&e);
            }
        }
    }
}
