//! Action Executor: runs an intent's input steps in order, then judges the
//! run by what the screen shows afterwards.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    Bounds, InputEvent, Intent, IntentKind, IntentTarget, Layout, Observation, Outcome,
    PerceptionSource, ScreenState, Side,
};
use crate::perception::Perceiver;
use crate::reconciler::Thresholds;
use crate::retry::with_timeout;
use crate::transport::Transport;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    pub steps_completed: usize,
    pub verified_by: Option<PerceptionSource>,
    pub error: Option<BridgeError>,
}

pub struct ActionExecutor {
    transport: Arc<dyn Transport>,
    perceiver: Arc<Perceiver>,
    thresholds: Thresholds,
    step_timeout: Duration,
    settle: Duration,
}

impl ActionExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        perceiver: Arc<Perceiver>,
        thresholds: Thresholds,
        step_timeout: Duration,
        settle: Duration,
    ) -> Self {
        Self {
            transport,
            perceiver,
            thresholds,
            step_timeout,
            settle,
        }
    }

    /// Execute `intent` against `device`. `layout` is the geometry from the
    /// perception pass the intent was derived from.
    pub async fn execute(&self, device: &str, intent: &Intent, layout: Layout) -> ExecutionReport {
        if intent.kind == IntentKind::None {
            return ExecutionReport {
                outcome: Outcome::Failed,
                steps_completed: 0,
                verified_by: None,
                error: Some(BridgeError::Step {
                    index: 0,
                    reason: "nothing to execute".into(),
                }),
            };
        }

        let mut current = Some(layout);
        for (index, step) in intent.steps.iter().enumerate() {
            debug!(device, step = index, event = ?step, "executing step");
            if let Err(e) = self.run_step(device, index, step, &mut current).await {
                warn!(device, step = index, error = %e, "step failed, abandoning intent");
                return ExecutionReport {
                    outcome: Outcome::Failed,
                    steps_completed: index,
                    verified_by: None,
                    error: Some(e),
                };
            }
        }

        sleep(self.settle).await;
        let (observation, layout) = self.perceiver.observe(device).await;
        let verified_by = observation.source();
        match self.verify(intent, &observation, &layout) {
            Ok(()) => {
                info!(device, kind = ?intent.kind, source = ?verified_by, "post-condition verified");
                ExecutionReport {
                    outcome: Outcome::Succeeded,
                    steps_completed: intent.steps.len(),
                    verified_by,
                    error: None,
                }
            }
            Err(e) => {
                warn!(device, kind = ?intent.kind, error = %e, "post-condition not met");
                ExecutionReport {
                    outcome: Outcome::Failed,
                    steps_completed: intent.steps.len(),
                    verified_by,
                    error: Some(e),
                }
            }
        }
    }

    async fn run_step(
        &self,
        device: &str,
        index: usize,
        step: &InputEvent,
        layout: &mut Option<Layout>,
    ) -> BridgeResult<()> {
        let step_err = |reason: String| BridgeError::Step { index, reason };

        let tap_at = match step {
            InputEvent::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                *layout = None;
                return Ok(());
            }
            InputEvent::TypeText { text } => {
                with_timeout(self.step_timeout, "text input", self.transport.inject_text(device, text))
                    .await
                    .map_err(|e| step_err(e.to_string()))?;
                *layout = None;
                return Ok(());
            }
            InputEvent::Tap { x, y } => (*x, *y),
            InputEvent::TapLabel { label } => {
                let current = self.layout(device, layout).await;
                current
                    .find_label(label, None)
                    .ok_or_else(|| step_err(format!("label '{}' not on screen", label)))?
                    .center()
            }
            InputEvent::TapInRow { symbol, side, label } => {
                let current = self.layout(device, layout).await;
                let row = current.find_row(symbol, *side).ok_or_else(|| {
                    step_err(format!("no row for {} {}", symbol, side.map(|s| s.as_str()).unwrap_or("")))
                })?;
                tap_point_in_row(current, &row, label.as_deref())
                    .ok_or_else(|| step_err(format!("'{}' not inside {} row", label.as_deref().unwrap_or(""), symbol)))?
            }
        };

        with_timeout(self.step_timeout, "tap", self.transport.inject_tap(device, tap_at.0, tap_at.1))
            .await
            .map_err(|e| step_err(e.to_string()))?;
        *layout = None;
        Ok(())
    }

    /// Geometry of the current screen; re-perceived after any input.
    async fn layout<'a>(&self, device: &str, cached: &'a mut Option<Layout>) -> &'a Layout {
        if cached.is_none() {
            let (_, fresh) = self.perceiver.observe(device).await;
            *cached = Some(fresh);
        }
        cached.get_or_insert_with(Layout::default)
    }

    fn verify(&self, intent: &Intent, observation: &Observation, layout: &Layout) -> BridgeResult<()> {
        let screen = match observation {
            Observation::Screen(s)
                if s.confidence >= self.thresholds.min_confidence(s.perception_source) =>
            {
                s
            }
            Observation::Screen(s) => {
                return Err(BridgeError::ExecutionVerificationFailed(format!(
                    "verification screen confidence {:.2} below threshold",
                    s.confidence
                )))
            }
            Observation::Unusable(_) => {
                return Err(BridgeError::ExecutionVerificationFailed(
                    "screen unreadable after execution".into(),
                ))
            }
        };

        let met = match (&intent.kind, &intent.target) {
            (IntentKind::OpenPosition, Some(IntentTarget::Position { symbol, side, lot })) => {
                if !(screen.positions_visible && position_shown(screen, symbol, *side)) {
                    false
                } else if let Some(filled) = filled_lot_mismatch(layout, symbol, *side, *lot) {
                    return Err(BridgeError::ExecutionVerificationFailed(format!(
                        "{} filled with lot {}, wanted {}",
                        symbol,
                        filled,
                        lot.map(|l| l.normalize().to_string()).unwrap_or_default()
                    )));
                } else {
                    true
                }
            }
            (IntentKind::ClosePosition, Some(IntentTarget::Position { symbol, side, .. })) => {
                screen.positions_visible && !position_shown(screen, symbol, *side)
            }
            (IntentKind::DismissDialog, Some(IntentTarget::Dialog(kind))) => {
                !screen.pending_dialogs.contains(kind)
            }
            _ => false,
        };
        if met {
            Ok(())
        } else {
            Err(BridgeError::ExecutionVerificationFailed(format!(
                "{:?} on {:?} not observed",
                intent.kind, intent.target
            )))
        }
    }
}

fn position_shown(screen: &ScreenState, symbol: &str, side: Option<Side>) -> bool {
    screen
        .open_positions
        .iter()
        .any(|k| k.symbol == symbol && side.map(|s| s == k.side).unwrap_or(true))
}

/// The lot a freshly opened row shows, when it shows one that differs from
/// the requested lot.
fn filled_lot_mismatch(layout: &Layout, symbol: &str, side: Option<Side>, wanted: Option<Decimal>) -> Option<Decimal> {
    let shown = layout.row(symbol, side)?.lot?;
    match wanted {
        Some(w) if w != shown => Some(shown),
        _ => None,
    }
}

fn tap_point_in_row(layout: &Layout, row: &Bounds, label: Option<&str>) -> Option<(i32, i32)> {
    match label {
        None => Some(row.center()),
        Some(l) => layout.find_label(l, Some(row)).map(|b| b.center()),
    }
}
