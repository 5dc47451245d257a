//! App profile: every string and flow that is specific to one trading app.
//!
//! Swapping target apps means swapping this file (JSON) and, at most, the
//! parsers; the reconciler never sees any of it.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{DialogKind, InputEvent, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSpec {
    pub kind: DialogKind,
    /// Phrases (case-insensitive, substring) that identify the dialog.
    pub markers: Vec<String>,
    /// Label tapped to dismiss it. Always the non-committing choice.
    pub dismiss_label: String,
}

/// Screen region as fractions of width/height.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Region {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepTemplate {
    Tap { x: i32, y: i32 },
    TapLabel { label: String },
    TapRow { label: Option<String> },
    Type { text: String },
    Wait { ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppProfile {
    pub name: String,
    pub symbol_pattern: String,
    pub side_pattern: String,
    pub lot_pattern: String,
    /// Upper-case words the symbol pattern would otherwise accept.
    pub reserved_words: Vec<String>,
    /// Optional allow-list; empty accepts anything the pattern accepts.
    pub symbols: Vec<String>,
    pub positions_labels: Vec<String>,
    pub positions_container_ids: Vec<String>,
    pub position_row_ids: Vec<String>,
    pub dialogs: Vec<DialogSpec>,
    pub ocr_positions_region: Option<Region>,
    pub open_steps: Vec<StepTemplate>,
    pub close_steps: Vec<StepTemplate>,
    pub dismiss_wait_ms: u64,
}

impl Default for AppProfile {
    fn default() -> Self {
        let words = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            name: "pu-prime".to_string(),
            symbol_pattern: r"\b([A-Z]{3,7}(?:USD|JPY|EUR|GBP|AUD|NZD|CHF|CAD)?)\b".to_string(),
            side_pattern: r"\b(BUY|SELL)\b".to_string(),
            lot_pattern: r"(?i)(?:lots?|volume|vol)?\s*[:=]?\s*(\d+(?:\.\d+)?)".to_string(),
            reserved_words: words(&[
                "BUY", "SELL", "OPEN", "CLOSE", "CLOSED", "ORDER", "ORDERS", "TRADE", "TRADES",
                "QUOTES", "CHART", "CHARTS", "HISTORY", "VOLUME", "LOT", "LOTS", "PRICE", "PROFIT",
                "LOSS", "MARKET", "LIMIT", "STOP", "BALANCE", "EQUITY", "MARGIN", "FREE", "LEVEL",
                "CANCEL", "CONFIRM", "RETRY", "SETTINGS", "ACCOUNT", "DEPOSIT", "SWAP", "NEW",
                "MODIFY", "DONE", "TOTAL", "SEARCH", "POSITION", "PENDING",
            ]),
            symbols: Vec::new(),
            positions_labels: words(&["Positions", "Open Positions"]),
            positions_container_ids: words(&["position_list", "rv_position", "positions"]),
            position_row_ids: words(&["item_position", "position_item", "position_row"]),
            dialogs: vec![
                DialogSpec {
                    kind: DialogKind::OrderConfirmation,
                    markers: words(&["confirm order", "order confirmation"]),
                    dismiss_label: "Cancel".to_string(),
                },
                DialogSpec {
                    kind: DialogKind::CloseConfirmation,
                    markers: words(&["close position?", "confirm close"]),
                    dismiss_label: "Cancel".to_string(),
                },
                DialogSpec {
                    kind: DialogKind::TradeError,
                    markers: words(&[
                        "market is closed",
                        "not enough money",
                        "trade is disabled",
                        "invalid volume",
                        "off quotes",
                        "requote",
                    ]),
                    dismiss_label: "OK".to_string(),
                },
                DialogSpec {
                    kind: DialogKind::ConnectionLost,
                    markers: words(&["no connection", "connection lost", "network error"]),
                    dismiss_label: "OK".to_string(),
                },
                DialogSpec {
                    kind: DialogKind::Announcement,
                    markers: words(&["don't show again", "what's new"]),
                    dismiss_label: "Close".to_string(),
                },
            ],
            ocr_positions_region: Some(Region { left: 0.0, top: 0.12, right: 1.0, bottom: 0.92 }),
            open_steps: vec![
                StepTemplate::TapLabel { label: "Quotes".into() },
                StepTemplate::Wait { ms: 500 },
                StepTemplate::TapLabel { label: "{symbol}".into() },
                StepTemplate::Wait { ms: 500 },
                StepTemplate::TapLabel { label: "New Order".into() },
                StepTemplate::Wait { ms: 700 },
                StepTemplate::TapLabel { label: "Volume".into() },
                StepTemplate::Type { text: "{lot}".into() },
                StepTemplate::TapLabel { label: "{side}".into() },
                StepTemplate::Wait { ms: 900 },
                StepTemplate::TapLabel { label: "Positions".into() },
                StepTemplate::Wait { ms: 500 },
            ],
            close_steps: vec![
                StepTemplate::TapLabel { label: "Positions".into() },
                StepTemplate::Wait { ms: 500 },
                StepTemplate::TapRow { label: None },
                StepTemplate::Wait { ms: 600 },
                StepTemplate::TapLabel { label: "Close".into() },
                StepTemplate::Wait { ms: 600 },
                StepTemplate::TapLabel { label: "Confirm".into() },
                StepTemplate::Wait { ms: 900 },
            ],
            dismiss_wait_ms: 500,
        }
    }
}

impl AppProfile {
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read profile {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("invalid profile {}: {}", path.display(), e)))
    }

    pub fn dialog(&self, kind: DialogKind) -> Option<&DialogSpec> {
        self.dialogs.iter().find(|d| d.kind == kind)
    }

    pub fn open_plan(&self, symbol: &str, side: Side, lot: Decimal) -> Vec<InputEvent> {
        let vars = Vars { symbol, side: Some(side), lot: Some(lot) };
        self.open_steps.iter().map(|t| vars.render(t)).collect()
    }

    pub fn close_plan(&self, symbol: &str, side: Option<Side>) -> Vec<InputEvent> {
        let vars = Vars { symbol, side, lot: None };
        self.close_steps.iter().map(|t| vars.render(t)).collect()
    }

    pub fn dismiss_plan(&self, kind: DialogKind) -> Option<Vec<InputEvent>> {
        let spec = self.dialog(kind)?;
        Some(vec![
            InputEvent::TapLabel { label: spec.dismiss_label.clone() },
            InputEvent::Wait { ms: self.dismiss_wait_ms },
        ])
    }
}

struct Vars<'a> {
    symbol: &'a str,
    side: Option<Side>,
    lot: Option<Decimal>,
}

impl Vars<'_> {
    fn fill(&self, raw: &str) -> String {
        let side = self.side.map(|s| s.as_str()).unwrap_or("");
        let lot = self.lot.map(|l| l.normalize().to_string()).unwrap_or_default();
        raw.replace("{symbol}", self.symbol)
            .replace("{side}", side)
            .replace("{lot}", &lot)
    }

    fn render(&self, template: &StepTemplate) -> InputEvent {
        match template {
            StepTemplate::Tap { x, y } => InputEvent::Tap { x: *x, y: *y },
            StepTemplate::TapLabel { label } => InputEvent::TapLabel { label: self.fill(label) },
            StepTemplate::TapRow { label } => InputEvent::TapInRow {
                symbol: self.symbol.to_string(),
                side: self.side,
                label: label.as_ref().map(|l| self.fill(l)),
            },
            StepTemplate::Type { text } => InputEvent::TypeText { text: self.fill(text) },
            StepTemplate::Wait { ms } => InputEvent::Wait { ms: *ms },
        }
    }
}
