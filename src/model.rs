//! Core data model shared by every stage of a reconciliation cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =====================================================
// SIGNAL SIDE
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotence key of a signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub String);

impl SequenceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded signal. Immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredAction {
    pub action: Action,
    pub symbol: String,
    pub side: Option<Side>,
    pub lot: Option<Decimal>,
    pub issued_at: DateTime<Utc>,
    pub sequence_id: SequenceId,
}

impl DesiredAction {
    /// CLOSE signals may omit the side; they then match any side.
    pub fn matches(&self, key: &PositionKey) -> bool {
        key.symbol == self.symbol && self.side.map(|s| s == key.side).unwrap_or(true)
    }
}

// =====================================================
// SCREEN STATE
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub side: Side,
}

impl PositionKey {
    pub fn new(symbol: &str, side: Side) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            side,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.side)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    OrderConfirmation,
    CloseConfirmation,
    TradeError,
    ConnectionLost,
    Announcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerceptionSource {
    Structured,
    Ocr,
}

impl PerceptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerceptionSource::Structured => "structured",
            PerceptionSource::Ocr => "ocr",
        }
    }
}

/// Screen-space rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn contains(&self, other: &Bounds) -> bool {
        other.left >= self.left
            && other.right <= self.right
            && other.top >= self.top
            && other.bottom <= self.bottom
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Overlap of the vertical extents relative to the shorter box.
    pub fn vertical_overlap(&self, other: &Bounds) -> f32 {
        let overlap = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0);
        let shorter = (self.bottom - self.top).min(other.bottom - other.top).max(1);
        overlap as f32 / shorter as f32
    }
}

/// Normalised snapshot of the trading screen. Accepted whole or discarded whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenState {
    pub open_positions: BTreeSet<PositionKey>,
    pub pending_dialogs: BTreeSet<DialogKind>,
    /// Whether the positions list itself was on screen. A dialog-only
    /// snapshot says nothing about which positions exist.
    pub positions_visible: bool,
    pub timestamp: DateTime<Utc>,
    pub perception_source: PerceptionSource,
    pub confidence: f32,
}

impl ScreenState {
    pub fn has_position(&self, desired: &DesiredAction) -> bool {
        self.open_positions.iter().any(|k| desired.matches(k))
    }
}

/// Why a perception strategy produced nothing usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unusable {
    pub source: PerceptionSource,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Observation {
    Screen(ScreenState),
    Unusable(Vec<Unusable>),
}

impl Observation {
    pub fn source(&self) -> Option<PerceptionSource> {
        match self {
            Observation::Screen(s) => Some(s.perception_source),
            Observation::Unusable(_) => None,
        }
    }

    pub fn screen(&self) -> Option<&ScreenState> {
        match self {
            Observation::Screen(s) => Some(s),
            Observation::Unusable(_) => None,
        }
    }
}

/// One strategy's verdict on a screen. The layout is kept even when the
/// state is unusable: intermediate screens of a flow carry no markers but
/// still have labels to tap.
#[derive(Debug, Clone)]
pub struct Perceived {
    pub state: Result<ScreenState, Unusable>,
    pub layout: Layout,
}

impl Perceived {
    pub fn unusable(source: PerceptionSource, reason: impl Into<String>) -> Self {
        Self {
            state: Err(Unusable { source, reason: reason.into() }),
            layout: Layout::default(),
        }
    }
}

/// Element geometry gathered alongside a `ScreenState`, used to resolve
/// label taps at execution time and to read back row details.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    pub labels: Vec<LabelBox>,
    pub rows: BTreeMap<PositionKey, PositionRow>,
}

/// Where an open position's row sits, and the lot it displays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionRow {
    pub bounds: Bounds,
    pub lot: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelBox {
    pub text: String,
    pub bounds: Bounds,
    pub clickable: bool,
}

impl Layout {
    /// Exact (case-insensitive) label match, preferring clickable elements,
    /// then the smallest box.
    pub fn find_label(&self, label: &str, within: Option<&Bounds>) -> Option<Bounds> {
        let wanted = label.trim().to_lowercase();
        self.labels
            .iter()
            .filter(|l| l.text.trim().to_lowercase() == wanted && !l.bounds.is_empty())
            .filter(|l| within.map(|w| w.contains(&l.bounds)).unwrap_or(true))
            .min_by_key(|l| {
                let area = (l.bounds.right - l.bounds.left) * (l.bounds.bottom - l.bounds.top);
                (!l.clickable, area)
            })
            .map(|l| l.bounds)
    }

    pub fn find_row(&self, symbol: &str, side: Option<Side>) -> Option<Bounds> {
        self.row(symbol, side).map(|r| r.bounds)
    }

    pub fn row(&self, symbol: &str, side: Option<Side>) -> Option<&PositionRow> {
        self.rows
            .iter()
            .find(|(k, _)| k.symbol == symbol && side.map(|s| s == k.side).unwrap_or(true))
            .map(|(_, r)| r)
    }
}

// =====================================================
// INTENT
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentKind {
    OpenPosition,
    ClosePosition,
    DismissDialog,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    Tap { x: i32, y: i32 },
    /// Tap the element carrying this label on the current screen.
    TapLabel { label: String },
    /// Tap inside the row of an open position: on `label` if given, else the row itself.
    TapInRow {
        symbol: String,
        side: Option<Side>,
        label: Option<String>,
    },
    TypeText { text: String },
    Wait { ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentTarget {
    /// `lot` is the volume an OPEN asks for; CLOSE leaves it unset.
    Position {
        symbol: String,
        side: Option<Side>,
        lot: Option<Decimal>,
    },
    Dialog(DialogKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoActionReason {
    AlreadySucceeded,
    AttemptsExhausted,
    PerceptionInsufficient,
    AlreadySatisfied,
    /// An OPEN without side or lot reached the reconciler.
    InvalidSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub target: Option<IntentTarget>,
    pub steps: Vec<InputEvent>,
    /// Set only for `IntentKind::None`.
    pub reason: Option<NoActionReason>,
}

impl Intent {
    pub fn none(reason: NoActionReason) -> Self {
        Self {
            kind: IntentKind::None,
            target: None,
            steps: Vec::new(),
            reason: Some(reason),
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == IntentKind::None
    }
}

// =====================================================
// EXECUTION RECORD
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Succeeded,
    Failed,
    SkippedAlreadySatisfied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "SUCCEEDED",
            Outcome::Failed => "FAILED",
            Outcome::SkippedAlreadySatisfied => "SKIPPED_ALREADY_SATISFIED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub sequence_id: SequenceId,
    pub attempted_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub attempt_count: u32,
}
