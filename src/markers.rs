//! Marker matching shared by the structured and OCR parsers.
//!
//! Both strategies reduce their raw observation to text fragments and hand
//! them to the same `MarkerSet`, then assemble the result with `Findings`.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    Bounds, DialogKind, LabelBox, Layout, Perceived, PerceptionSource, PositionKey, PositionRow,
    ScreenState, Side, Unusable,
};
use crate::profile::AppProfile;
use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

/// Confidence lost per partial or ambiguous row.
const ISSUE_PENALTY: f32 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub enum RowMatch {
    Full { key: PositionKey, lot: Option<Decimal> },
    /// A symbol without a readable side.
    Partial { symbol: String },
    /// Several symbols or both sides in one row.
    Ambiguous,
    Nothing,
}

pub struct MarkerSet {
    symbol_re: Regex,
    side_re: Regex,
    lot_re: Regex,
    reserved: HashSet<String>,
    allowed: HashSet<String>,
    positions_labels: Vec<String>,
    container_ids: Vec<String>,
    row_ids: Vec<String>,
    dialogs: Vec<(DialogKind, Vec<String>, String)>,
}

impl MarkerSet {
    pub fn compile(profile: &AppProfile) -> BridgeResult<Self> {
        let re = |name: &str, pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| BridgeError::Config(format!("profile {} is not a valid regex: {}", name, e)))
        };
        let lower = |xs: &[String]| xs.iter().map(|s| s.trim().to_lowercase()).collect::<Vec<_>>();
        Ok(Self {
            symbol_re: re("symbol_pattern", &profile.symbol_pattern)?,
            side_re: re("side_pattern", &profile.side_pattern)?,
            lot_re: re("lot_pattern", &profile.lot_pattern)?,
            reserved: profile.reserved_words.iter().map(|w| w.to_uppercase()).collect(),
            allowed: profile.symbols.iter().map(|w| w.to_uppercase()).collect(),
            positions_labels: lower(&profile.positions_labels),
            container_ids: lower(&profile.positions_container_ids),
            row_ids: lower(&profile.position_row_ids),
            dialogs: profile
                .dialogs
                .iter()
                .map(|d| (d.kind, lower(&d.markers), d.dismiss_label.trim().to_lowercase()))
                .collect(),
        })
    }

    pub fn symbols_in(&self, text: &str) -> BTreeSet<String> {
        let upper = text.to_uppercase();
        self.symbol_re
            .captures_iter(&upper)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|s| !self.reserved.contains(s))
            .filter(|s| self.allowed.is_empty() || self.allowed.contains(s))
            .collect()
    }

    pub fn sides_in(&self, text: &str) -> BTreeSet<Side> {
        let upper = text.to_uppercase();
        self.side_re
            .captures_iter(&upper)
            .filter_map(|c| c.get(1).and_then(|m| Side::parse(m.as_str())))
            .collect()
    }

    pub fn lot_in(&self, text: &str) -> Option<Decimal> {
        self.lot_re
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .filter_map(|m| Decimal::from_str(m.as_str()).ok())
            .find(|lot| *lot > Decimal::ZERO)
    }

    pub fn match_row(&self, text: &str) -> RowMatch {
        let symbols = self.symbols_in(text);
        let sides = self.sides_in(text);
        match (symbols.len(), sides.len()) {
            (0, _) => RowMatch::Nothing,
            (1, 0) => RowMatch::Partial {
                symbol: symbols.into_iter().next().unwrap_or_default(),
            },
            (1, 1) => {
                let symbol = symbols.into_iter().next().unwrap_or_default();
                let side = sides.into_iter().next().unwrap_or(Side::Buy);
                // Strip the symbol before looking for a lot so "US30"-style
                // digits inside symbols never read as volume.
                let rest = text.to_uppercase().replace(&symbol, " ");
                RowMatch::Full {
                    key: PositionKey::new(&symbol, side),
                    lot: self.lot_in(&rest),
                }
            }
            _ => RowMatch::Ambiguous,
        }
    }

    pub fn is_positions_label(&self, text: &str) -> bool {
        let t = text.trim().to_lowercase();
        !t.is_empty() && self.positions_labels.iter().any(|l| *l == t)
    }

    /// Word-aligned containment, for OCR lines where a tab bar reads as
    /// one line ("Quotes Positions History").
    pub fn mentions_positions_label(&self, text: &str) -> bool {
        let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
        self.positions_labels.iter().any(|label| {
            let wanted: Vec<&str> = label.split_whitespace().collect();
            !wanted.is_empty()
                && words
                    .windows(wanted.len())
                    .any(|w| w.iter().zip(&wanted).all(|(a, b)| a == b))
        })
    }

    pub fn is_positions_container(&self, resource_id: &str) -> bool {
        let id = resource_id.to_lowercase();
        !id.is_empty() && self.container_ids.iter().any(|c| id.contains(c.as_str()))
    }

    pub fn is_row_id(&self, resource_id: &str) -> bool {
        let id = resource_id.to_lowercase();
        !id.is_empty() && self.row_ids.iter().any(|c| id.contains(c.as_str()))
    }

    pub fn dialogs_in(&self, text: &str) -> Vec<DialogKind> {
        let t = text.to_lowercase();
        self.dialogs
            .iter()
            .filter(|(_, markers, _)| markers.iter().any(|m| !m.is_empty() && t.contains(m.as_str())))
            .map(|(kind, _, _)| *kind)
            .collect()
    }

    pub fn dismiss_label(&self, kind: DialogKind) -> Option<&str> {
        self.dialogs
            .iter()
            .find(|(k, _, _)| *k == kind)
            .map(|(_, _, label)| label.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FoundRow {
    pub key: PositionKey,
    pub lot: Option<Decimal>,
    pub bounds: Option<Bounds>,
}

/// Everything one parser found, before it is judged usable or not.
#[derive(Debug, Default)]
pub struct Findings {
    /// The positions list itself is on screen. Rows found without it are
    /// discarded: an order form names a symbol and a side too.
    pub positions_marker: bool,
    pub rows: Vec<FoundRow>,
    pub partial_rows: usize,
    pub ambiguous_rows: usize,
    pub dialogs: BTreeSet<DialogKind>,
    pub labels: Vec<LabelBox>,
}

impl Findings {
    pub fn record_row(&mut self, m: RowMatch, bounds: Option<Bounds>) {
        match m {
            RowMatch::Full { key, lot } => self.rows.push(FoundRow { key, lot, bounds }),
            RowMatch::Partial { .. } => self.partial_rows += 1,
            RowMatch::Ambiguous => self.ambiguous_rows += 1,
            RowMatch::Nothing => {}
        }
    }

    fn issues(&self) -> usize {
        self.partial_rows + self.ambiguous_rows
    }

    /// Judge the findings. `base` is the strategy's own certainty (1.0 for
    /// the UI tree, the mean word score for OCR); `cap` bounds the result.
    /// The labels survive either way.
    pub fn into_perceived(self, source: PerceptionSource, base: f32, cap: f32) -> Perceived {
        let positions_visible = self.positions_marker;
        if !positions_visible && self.dialogs.is_empty() {
            return Perceived {
                state: Err(Unusable {
                    source,
                    reason: "no positions view or dialog markers found".to_string(),
                }),
                layout: Layout { labels: self.labels, rows: BTreeMap::new() },
            };
        }

        let penalty = if positions_visible { ISSUE_PENALTY * self.issues() as f32 } else { 0.0 };
        let confidence = (base.min(cap) - penalty).clamp(0.0, 1.0);

        let mut rows = BTreeMap::new();
        let mut open_positions = BTreeSet::new();
        if positions_visible {
            for row in self.rows {
                if let Some(bounds) = row.bounds {
                    rows.entry(row.key.clone()).or_insert(PositionRow { bounds, lot: row.lot });
                }
                open_positions.insert(row.key);
            }
        }

        let state = ScreenState {
            open_positions,
            pending_dialogs: self.dialogs,
            positions_visible,
            timestamp: Utc::now(),
            perception_source: source,
            confidence,
        };
        Perceived {
            state: Ok(state),
            layout: Layout { labels: self.labels, rows },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> MarkerSet {
        MarkerSet::compile(&AppProfile::default()).unwrap()
    }

    #[test]
    fn test_full_row_with_lot() {
        let m = markers();
        assert_eq!(
            m.match_row("XAUUSD, buy 0.10  2345.10 -> 2350.00"),
            RowMatch::Full {
                key: PositionKey::new("XAUUSD", Side::Buy),
                lot: Some(Decimal::from_str("0.10").unwrap())
            }
        );
    }

    #[test]
    fn test_reserved_words_are_not_symbols() {
        let m = markers();
        assert!(m.symbols_in("BUY SELL CLOSE Profit Quotes").is_empty());
        assert_eq!(m.match_row("Sell by Market"), RowMatch::Nothing);
    }

    #[test]
    fn test_partial_and_ambiguous_rows() {
        let m = markers();
        assert_eq!(m.match_row("EURUSD 1.08450"), RowMatch::Partial { symbol: "EURUSD".into() });
        assert_eq!(m.match_row("EURUSD buy GBPUSD sell"), RowMatch::Ambiguous);
        assert_eq!(m.match_row("EURUSD buy sell"), RowMatch::Ambiguous);
    }

    #[test]
    fn test_dialog_and_positions_markers() {
        let m = markers();
        assert_eq!(m.dialogs_in("Market is closed"), vec![DialogKind::TradeError]);
        assert!(m.is_positions_label(" positions "));
        assert!(!m.is_positions_label("Positions history"));
        assert!(m.mentions_positions_label("Quotes Positions History"));
        assert!(!m.mentions_positions_label("Position sizing"));
        assert!(m.is_positions_container("com.puprime:id/rv_position_list"));
        assert_eq!(m.dismiss_label(DialogKind::TradeError), Some("ok"));
    }

    fn label(text: &str) -> LabelBox {
        LabelBox { text: text.into(), bounds: Bounds::new(0, 0, 200, 80), clickable: true }
    }

    #[test]
    fn test_findings_without_markers_are_unusable_but_keep_labels() {
        let f = Findings { labels: vec![label("Volume")], ..Default::default() };
        let perceived = f.into_perceived(PerceptionSource::Structured, 1.0, 1.0);
        assert_eq!(perceived.state.unwrap_err().source, PerceptionSource::Structured);
        assert!(perceived.layout.find_label("volume", None).is_some());
    }

    #[test]
    fn test_rows_without_positions_view_are_discarded() {
        let mut f = Findings { dialogs: BTreeSet::from([DialogKind::TradeError]), ..Default::default() };
        f.record_row(markers().match_row("XAUUSD BUY"), Some(Bounds::new(0, 0, 1080, 100)));
        let perceived = f.into_perceived(PerceptionSource::Structured, 1.0, 1.0);
        let state = perceived.state.unwrap();
        assert!(!state.positions_visible);
        assert!(state.open_positions.is_empty());
        assert!(perceived.layout.rows.is_empty());
    }

    #[test]
    fn test_row_lot_carried_into_layout() {
        let mut f = Findings { positions_marker: true, ..Default::default() };
        f.record_row(markers().match_row("XAUUSD buy 0.10"), Some(Bounds::new(0, 200, 1080, 350)));
        let layout = f.into_perceived(PerceptionSource::Structured, 1.0, 1.0).layout;
        let row = layout.row("XAUUSD", Some(Side::Buy)).unwrap();
        assert_eq!(row.lot, Some(Decimal::from_str("0.1").unwrap()));
    }

    #[test]
    fn test_findings_confidence_penalised_and_capped() {
        let mut f = Findings { positions_marker: true, ..Default::default() };
        f.record_row(RowMatch::Partial { symbol: "EURUSD".into() }, None);
        let state = f.into_perceived(PerceptionSource::Ocr, 0.95, 0.85).state.unwrap();
        assert!((state.confidence - 0.60).abs() < 1e-4);
        assert!(state.positions_visible);
        assert!(state.open_positions.is_empty());
    }
}
