//! State Reconciler: desired action + observed screen + history -> one intent.
//!
//! Pure. Every input arrives as an argument, nothing is read from ambient
//! state, and the same inputs always yield the same intent.
//!
//! Order of evaluation:
//! 1. the signal already SUCCEEDED, or ran out of attempts: nothing to do
//! 2. the screen is unusable or below its source's threshold: nothing to do
//! 3. the positions view shows the goal already reached: skip
//! 4. a dialog is pending: dismiss it, and only that, this cycle
//! 5. otherwise open or close

use crate::config::BridgeConfig;
use crate::history::HistoryLookup;
use crate::model::{
    Action, DesiredAction, Intent, IntentKind, IntentTarget, NoActionReason, Observation,
    Outcome, PerceptionSource,
};
use crate::profile::AppProfile;

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub structured_min_confidence: f32,
    pub ocr_min_confidence: f32,
    pub max_attempts: u32,
}

impl Thresholds {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            structured_min_confidence: config.structured_min_confidence,
            ocr_min_confidence: config.ocr_min_confidence,
            max_attempts: config.max_attempts,
        }
    }

    pub fn min_confidence(&self, source: PerceptionSource) -> f32 {
        match source {
            PerceptionSource::Structured => self.structured_min_confidence,
            PerceptionSource::Ocr => self.ocr_min_confidence,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// History-only part of the decision. `Some` means the signal is settled and
/// the screen need not even be looked at.
pub fn settled(
    desired: &DesiredAction,
    history: &impl HistoryLookup,
    thresholds: &Thresholds,
) -> Option<Intent> {
    let record = history.get(&desired.sequence_id)?;
    match record.outcome {
        Outcome::Succeeded => Some(Intent::none(NoActionReason::AlreadySucceeded)),
        Outcome::Failed if record.attempt_count >= thresholds.max_attempts => {
            Some(Intent::none(NoActionReason::AttemptsExhausted))
        }
        _ => None,
    }
}

pub fn reconcile(
    desired: &DesiredAction,
    observation: &Observation,
    history: &impl HistoryLookup,
    thresholds: &Thresholds,
    profile: &AppProfile,
) -> Intent {
    if let Some(done) = settled(desired, history, thresholds) {
        return done;
    }

    let screen = match observation {
        Observation::Screen(s) if s.confidence >= thresholds.min_confidence(s.perception_source) => s,
        _ => return Intent::none(NoActionReason::PerceptionInsufficient),
    };

    // A screen without the positions list proves nothing about positions.
    if screen.positions_visible {
        let present = screen.has_position(desired);
        match desired.action {
            Action::Open if present => return Intent::none(NoActionReason::AlreadySatisfied),
            Action::Close if !present => return Intent::none(NoActionReason::AlreadySatisfied),
            _ => {}
        }
    }

    if let Some(kind) = screen.pending_dialogs.iter().next().copied() {
        return match profile.dismiss_plan(kind) {
            Some(steps) => Intent {
                kind: IntentKind::DismissDialog,
                target: Some(IntentTarget::Dialog(kind)),
                steps,
                reason: None,
            },
            None => Intent::none(NoActionReason::PerceptionInsufficient),
        };
    }

    if !screen.positions_visible {
        return Intent::none(NoActionReason::PerceptionInsufficient);
    }

    let target = Some(IntentTarget::Position {
        symbol: desired.symbol.clone(),
        side: desired.side,
        lot: match desired.action {
            Action::Open => desired.lot,
            Action::Close => None,
        },
    });
    match desired.action {
        Action::Open => {
            let (Some(side), Some(lot)) = (desired.side, desired.lot) else {
                return Intent::none(NoActionReason::InvalidSignal);
            };
            Intent {
                kind: IntentKind::OpenPosition,
                target,
                steps: profile.open_plan(&desired.symbol, side, lot),
                reason: None,
            }
        }
        Action::Close => Intent {
            kind: IntentKind::ClosePosition,
            target,
            steps: profile.close_plan(&desired.symbol, desired.side),
            reason: None,
        },
    }
}
