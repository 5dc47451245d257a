//! Structured perception: UI tree -> `ScreenState`.
//!
//! Rows are found by structure, not by pixel position: inside the positions
//! container, the smallest subtree whose combined text names exactly one
//! symbol and one side is a position row. Symbols left over outside any row
//! count against confidence. Without a container, only nodes whose resource
//! id marks them as position rows are read, and only under a positions label.

use crate::markers::{Findings, MarkerSet, RowMatch};
use crate::model::{DialogKind, LabelBox, Perceived, PerceptionSource};
use crate::ui_tree::UiNode;
use std::collections::BTreeSet;

pub fn parse(root: &UiNode, markers: &MarkerSet) -> Perceived {
    let nodes = root.walk();
    let mut findings = Findings {
        dialogs: detect_dialogs(&nodes, markers),
        labels: nodes
            .iter()
            .filter_map(|n| {
                let bounds = n.bounds?;
                Some(LabelBox {
                    text: n.label()?.to_string(),
                    bounds,
                    clickable: n.clickable,
                })
            })
            .collect(),
        ..Default::default()
    };

    let container = nodes
        .iter()
        .copied()
        .find(|n| markers.is_positions_container(&n.resource_id));
    match container {
        Some(scope) => {
            findings.positions_marker = true;
            let (_, strays) = scan(scope, markers, &mut findings);
            findings.partial_rows += strays;
        }
        None => {
            let labelled = nodes
                .iter()
                .any(|n| n.label().map(|l| markers.is_positions_label(l)).unwrap_or(false));
            let mut rows = Vec::new();
            row_nodes(root, markers, &mut rows);
            if labelled && !rows.is_empty() {
                findings.positions_marker = true;
                for row in rows {
                    findings.record_row(markers.match_row(&row.subtree_text()), row.bounds);
                }
            }
        }
    }

    findings.into_perceived(PerceptionSource::Structured, 1.0, 1.0)
}

/// Outermost nodes carrying a position-row resource id.
fn row_nodes<'a>(node: &'a UiNode, markers: &MarkerSet, out: &mut Vec<&'a UiNode>) {
    if markers.is_row_id(&node.resource_id) {
        out.push(node);
        return;
    }
    for child in &node.children {
        row_nodes(child, markers, out);
    }
}

/// Returns (subtree holds a recorded row, stray symbols outside rows).
fn scan(node: &UiNode, markers: &MarkerSet, findings: &mut Findings) -> (bool, usize) {
    let mut hit = false;
    let mut strays = 0;
    for child in &node.children {
        let (h, s) = scan(child, markers, findings);
        hit |= h;
        strays += s;
    }
    if hit {
        return (true, strays);
    }

    let text = node.subtree_text();
    match markers.match_row(&text) {
        m @ RowMatch::Full { .. } => {
            findings.record_row(m, node.bounds);
            (true, 0)
        }
        m @ (RowMatch::Partial { .. } | RowMatch::Ambiguous) if markers.is_row_id(&node.resource_id) => {
            findings.record_row(m, node.bounds);
            (true, 0)
        }
        _ if node.children.is_empty() => {
            let own = node.label().unwrap_or("");
            if own.is_empty() || !markers.dialogs_in(own).is_empty() {
                (false, 0)
            } else {
                (false, markers.symbols_in(own).len())
            }
        }
        _ => (false, strays),
    }
}

/// A dialog counts only when its marker text and its dismiss button are
/// both on screen.
fn detect_dialogs(nodes: &[&UiNode], markers: &MarkerSet) -> BTreeSet<DialogKind> {
    let mut found = BTreeSet::new();
    for node in nodes {
        let Some(label) = node.label() else { continue };
        for kind in markers.dialogs_in(label) {
            let Some(dismiss) = markers.dismiss_label(kind) else { continue };
            let has_button = nodes.iter().any(|n| {
                (n.clickable || n.class.contains("Button"))
                    && n.label().map(|l| l.trim().to_lowercase() == dismiss).unwrap_or(false)
            });
            if has_button {
                found.insert(kind);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bounds, PositionKey, Side};
    use crate::profile::AppProfile;
    use crate::ui_tree::parse_dump;
    use rust_decimal::Decimal;

    fn markers() -> MarkerSet {
        MarkerSet::compile(&AppProfile::default()).unwrap()
    }

    fn row(y: i32, symbol: &str, side: &str, lot: &str) -> String {
        format!(
            r#"<node text="" resource-id="com.app:id/item_position" class="android.widget.LinearLayout" clickable="true" bounds="[0,{y}][1080,{b}]">
                 <node text="{symbol}" resource-id="com.app:id/tv_symbol" class="android.widget.TextView" clickable="false" bounds="[20,{y}][300,{m}]" />
                 <node text="{side} {lot}" resource-id="com.app:id/tv_side" class="android.widget.TextView" clickable="false" bounds="[320,{y}][600,{m}]" />
               </node>"#,
            y = y,
            b = y + 150,
            m = y + 70,
            symbol = symbol,
            side = side,
            lot = lot
        )
    }

    fn dump(rows: &str, extra: &str) -> String {
        format!(
            r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0">
<node text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[0,0][1080,1920]">
  <node text="Positions" resource-id="com.app:id/tab_title" class="android.widget.TextView" clickable="true" bounds="[0,100][360,180]" />
  <node text="" resource-id="com.app:id/rv_position_list" class="androidx.recyclerview.widget.RecyclerView" clickable="false" bounds="[0,200][1080,1700]">{rows}</node>
  {extra}
</node></hierarchy>"#,
            rows = rows,
            extra = extra
        )
    }

    #[test]
    fn test_rows_resolved_by_structure() {
        let xml = dump(&(row(200, "XAUUSD", "buy", "0.10") + &row(360, "EURUSD", "sell", "1.00")), "");
        let tree = parse_dump(&xml).unwrap();
        let perceived = parse(&tree, &markers());
        let (state, layout) = (perceived.state.unwrap(), perceived.layout);
        assert_eq!(state.confidence, 1.0);
        assert!(state.positions_visible);
        assert!(state.open_positions.contains(&PositionKey::new("XAUUSD", Side::Buy)));
        assert!(state.open_positions.contains(&PositionKey::new("EURUSD", Side::Sell)));
        assert_eq!(layout.find_row("XAUUSD", Some(Side::Buy)), Some(Bounds::new(0, 200, 1080, 350)));
        assert!(layout.find_label("positions", None).is_some());
        assert_eq!(layout.row("EURUSD", None).and_then(|r| r.lot), Some(Decimal::ONE));
    }

    #[test]
    fn test_empty_positions_list_is_usable() {
        let tree = parse_dump(&dump("", "")).unwrap();
        let state = parse(&tree, &markers()).state.unwrap();
        assert!(state.open_positions.is_empty());
        assert!(state.positions_visible);
        assert_eq!(state.confidence, 1.0);
    }

    #[test]
    fn test_row_without_side_lowers_confidence() {
        let broken = r#"<node text="" resource-id="com.app:id/item_position" class="android.widget.LinearLayout" clickable="true" bounds="[0,520][1080,670]">
              <node text="GBPUSD" resource-id="" class="android.widget.TextView" clickable="false" bounds="[20,520][300,590]" />
              <node text="1.27110" resource-id="" class="android.widget.TextView" clickable="false" bounds="[320,520][600,590]" />
            </node>"#;
        let xml = dump(&(row(200, "XAUUSD", "buy", "0.10") + broken), "");
        let state = parse(&parse_dump(&xml).unwrap(), &markers()).state.unwrap();
        assert!(state.confidence < 0.9);
        assert_eq!(state.open_positions.len(), 1);
    }

    #[test]
    fn test_stray_symbol_outside_rows_lowers_confidence() {
        let stray = r#"<node text="USDJPY" resource-id="" class="android.widget.TextView" clickable="false" bounds="[20,1500][300,1560]" />"#;
        let xml = dump(&(row(200, "XAUUSD", "buy", "0.10") + stray), "");
        let state = parse(&parse_dump(&xml).unwrap(), &markers()).state.unwrap();
        assert!(state.confidence < 0.9);
    }

    #[test]
    fn test_dialog_only_screen() {
        let xml = r#"<?xml version='1.0' ?><hierarchy rotation="0">
<node text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[100,700][980,1200]">
  <node text="Market is closed" resource-id="android:id/message" class="android.widget.TextView" clickable="false" bounds="[140,760][940,900]" />
  <node text="OK" resource-id="android:id/button1" class="android.widget.Button" clickable="true" bounds="[700,1060][940,1160]" />
</node></hierarchy>"#;
        let state = parse(&parse_dump(xml).unwrap(), &markers()).state.unwrap();
        assert!(!state.positions_visible);
        assert!(state.pending_dialogs.contains(&DialogKind::TradeError));
    }

    #[test]
    fn test_dialog_text_without_button_is_not_a_dialog() {
        let banner = r#"<node text="Market is closed" resource-id="com.app:id/banner" class="android.widget.TextView" clickable="false" bounds="[0,1800][1080,1900]" />"#;
        let xml = dump(&row(200, "XAUUSD", "buy", "0.10"), banner);
        let state = parse(&parse_dump(&xml).unwrap(), &markers()).state.unwrap();
        assert!(state.pending_dialogs.is_empty());
    }

    #[test]
    fn test_unrelated_screen_is_unusable() {
        let xml = r#"<?xml version='1.0' ?><hierarchy rotation="0">
<node text="Settings" resource-id="" class="android.widget.TextView" clickable="false" bounds="[0,0][1080,100]" /></hierarchy>"#;
        let err = parse(&parse_dump(xml).unwrap(), &markers()).state.unwrap_err();
        assert_eq!(err.source, PerceptionSource::Structured);
    }

    #[test]
    fn test_order_form_is_not_a_positions_list() {
        let xml = r#"<?xml version='1.0' ?><hierarchy rotation="0">
<node text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[0,0][1080,1920]">
  <node text="XAUUSD" resource-id="com.app:id/tv_title" class="android.widget.TextView" clickable="false" bounds="[40,80][600,160]" />
  <node text="Volume" resource-id="com.app:id/et_volume" class="android.widget.EditText" clickable="true" bounds="[40,400][1040,500]" />
  <node text="BUY" resource-id="com.app:id/btn_buy" class="android.widget.Button" clickable="true" bounds="[560,1600][1040,1720]" />
</node></hierarchy>"#;
        let perceived = parse(&parse_dump(xml).unwrap(), &markers());
        assert!(perceived.state.is_err());
        assert!(perceived.layout.rows.is_empty());
        assert!(perceived.layout.find_label("volume", None).is_some());
        assert!(perceived.layout.find_label("buy", None).is_some());
    }

    #[test]
    fn test_positions_tab_alone_does_not_show_the_list() {
        let xml = r#"<?xml version='1.0' ?><hierarchy rotation="0">
<node text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[0,0][1080,1920]">
  <node text="XAUUSD BUY" resource-id="com.app:id/tv_quote" class="android.widget.TextView" clickable="true" bounds="[0,200][1080,350]" />
  <node text="Positions" resource-id="com.app:id/tab_title" class="android.widget.TextView" clickable="true" bounds="[360,1800][720,1900]" />
</node></hierarchy>"#;
        assert!(parse(&parse_dump(xml).unwrap(), &markers()).state.is_err());
    }

    #[test]
    fn test_row_ids_read_under_positions_label_without_container() {
        let xml = format!(
            r#"<?xml version='1.0' ?><hierarchy rotation="0">
<node text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[0,0][1080,1920]">
  <node text="Positions" resource-id="com.app:id/tab_title" class="android.widget.TextView" clickable="true" bounds="[0,100][360,180]" />
  <node text="" resource-id="com.app:id/list" class="android.widget.ListView" clickable="false" bounds="[0,200][1080,1700]">{}</node>
  <node text="EURUSD" resource-id="com.app:id/tv_banner" class="android.widget.TextView" clickable="false" bounds="[0,1750][1080,1800]" />
</node></hierarchy>"#,
            row(200, "XAUUSD", "sell", "0.30")
        );
        let state = parse(&parse_dump(&xml).unwrap(), &markers()).state.unwrap();
        assert!(state.positions_visible);
        assert_eq!(
            state.open_positions.iter().cloned().collect::<Vec<_>>(),
            vec![PositionKey::new("XAUUSD", Side::Sell)]
        );
    }
}
