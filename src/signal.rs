//! Signal Store Reader.
//!
//! The producer rewrites one JSON file in place. A read that lands on a
//! half-written file must surface as `MalformedSignal`, never as a panic.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{Action, DesiredAction, SequenceId, Side};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub struct SignalReader {
    path: PathBuf,
    max_age: Duration,
}

impl SignalReader {
    pub fn new(path: &Path, max_age: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no signal file exists.
    pub fn read(&self) -> BridgeResult<Option<DesiredAction>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            // Invalid UTF-8 is what a torn multi-byte write looks like.
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(BridgeError::MalformedSignal(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let desired = decode(&raw, modified)?;
        let age = Utc::now().signed_duration_since(desired.issued_at).num_seconds();
        if age > self.max_age.as_secs() as i64 {
            return Err(BridgeError::StaleSignal {
                age_secs: age,
                max_age_secs: self.max_age.as_secs(),
            });
        }
        debug!(sequence_id = %desired.sequence_id, action = ?desired.action, symbol = %desired.symbol, "signal read");
        Ok(Some(desired))
    }
}

fn malformed(reason: impl Into<String>) -> BridgeError {
    BridgeError::MalformedSignal(reason.into())
}

/// Decode one signal document. `fallback_issued_at` is used when the
/// document carries no timestamp of its own.
pub fn decode(raw: &str, fallback_issued_at: DateTime<Utc>) -> BridgeResult<DesiredAction> {
    if raw.trim().is_empty() {
        return Err(malformed("signal file is empty"));
    }
    let doc: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    let obj = doc.as_object().ok_or_else(|| malformed("signal is not a JSON object"))?;

    let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty());
    let either = |a: &str, b: &str| obj.get(a).or_else(|| obj.get(b));

    let action = match text("action").map(str::to_ascii_uppercase).as_deref() {
        Some("OPEN") => Action::Open,
        Some("CLOSE") => Action::Close,
        Some(other) => return Err(malformed(format!("unknown action '{}'", other))),
        None => return Err(malformed("missing action")),
    };
    let symbol = text("symbol")
        .map(str::to_ascii_uppercase)
        .ok_or_else(|| malformed("missing symbol"))?;
    let side = match text("side") {
        Some(raw) => Some(Side::parse(raw).ok_or_else(|| malformed(format!("unknown side '{}'", raw)))?),
        None => None,
    };
    let lot = match obj.get("lot") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_lot(v)?),
    };

    if action == Action::Open {
        if side.is_none() {
            return Err(malformed("OPEN requires side"));
        }
        if lot.is_none() {
            return Err(malformed("OPEN requires lot"));
        }
    }

    let issued_at = match either("issued_at", "issuedAt") {
        None | Some(Value::Null) => fallback_issued_at,
        Some(v) => parse_timestamp(v)?,
    };
    let sequence_id = match either("sequence_id", "sequenceId") {
        Some(Value::String(s)) if !s.trim().is_empty() => SequenceId(s.trim().to_string()),
        Some(Value::Number(n)) => SequenceId(n.to_string()),
        _ => content_key(action, &symbol, side, lot, issued_at),
    };

    Ok(DesiredAction {
        action,
        symbol,
        side,
        lot,
        issued_at,
        sequence_id,
    })
}

fn parse_lot(v: &Value) -> BridgeResult<Decimal> {
    let raw = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(malformed(format!("lot must be a number, got {}", other))),
    };
    let lot = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| malformed(format!("lot '{}' is not a decimal", raw)))?;
    if lot <= Decimal::ZERO {
        return Err(malformed(format!("lot must be positive, got {}", lot)));
    }
    Ok(lot)
}

fn parse_timestamp(v: &Value) -> BridgeResult<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| malformed(format!("issued_at '{}': {}", s, e))),
        Value::Number(n) => {
            let secs = n.as_f64().ok_or_else(|| malformed("issued_at out of range"))?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos)
                .single()
                .ok_or_else(|| malformed(format!("issued_at {} out of range", secs)))
        }
        other => Err(malformed(format!("issued_at must be a string or number, got {}", other))),
    }
}

/// Idempotence key for signals that carry no id: same content and same
/// issue time hash to the same key.
fn content_key(
    action: Action,
    symbol: &str,
    side: Option<Side>,
    lot: Option<Decimal>,
    issued_at: DateTime<Utc>,
) -> SequenceId {
    let canonical = format!(
        "{:?}|{}|{}|{}|{}",
        action,
        symbol,
        side.map(|s| s.as_str()).unwrap_or(""),
        lot.map(|l| l.normalize().to_string()).unwrap_or_default(),
        issued_at.timestamp_millis()
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    SequenceId(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(dir: &tempfile::TempDir, body: Option<&str>) -> SignalReader {
        let path = dir.path().join("signal.json");
        if let Some(body) = body {
            std::fs::write(&path, body).unwrap();
        }
        SignalReader::new(&path, Duration::from_secs(120))
    }

    #[test]
    fn test_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(reader(&dir, None).read().unwrap().is_none());
    }

    #[test]
    fn test_open_signal_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let r = reader(&dir, Some(r#"{"action":"open","symbol":"xauusd","side":"buy","lot":0.1,"note":"x"}"#));
        let d = r.read().unwrap().unwrap();
        assert_eq!(d.action, Action::Open);
        assert_eq!(d.symbol, "XAUUSD");
        assert_eq!(d.side, Some(Side::Buy));
        assert_eq!(d.lot, Some(Decimal::from_str("0.1").unwrap()));
        assert_eq!(d.sequence_id.as_str().len(), 64);
    }

    #[test]
    fn test_explicit_sequence_id_wins() {
        let now = Utc::now().to_rfc3339();
        let body = format!(r#"{{"action":"CLOSE","symbol":"EURUSD","sequenceId":"sig-42","issuedAt":"{}"}}"#, now);
        let d = decode(&body, Utc::now()).unwrap();
        assert_eq!(d.sequence_id, SequenceId("sig-42".into()));
        assert_eq!(d.side, None);
    }

    #[test]
    fn test_content_key_is_stable() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = r#"{"action":"OPEN","symbol":"XAUUSD","side":"BUY","lot":"0.10"}"#;
        let a = decode(body, at).unwrap();
        let b = decode(r#"{"lot":0.1,"side":"buy","symbol":"XAUUSD","action":"OPEN"}"#, at).unwrap();
        assert_eq!(a.sequence_id, b.sequence_id);
        let later = decode(body, at + chrono::Duration::seconds(5)).unwrap();
        assert_ne!(a.sequence_id, later.sequence_id);
    }

    #[test]
    fn test_open_without_side_or_lot_is_malformed() {
        let now = Utc::now();
        for body in [
            r#"{"action":"OPEN","symbol":"XAUUSD","lot":0.1}"#,
            r#"{"action":"OPEN","symbol":"XAUUSD","side":"BUY"}"#,
            r#"{"action":"OPEN","symbol":"XAUUSD","side":"BUY","lot":0}"#,
            r#"{"action":"HOLD","symbol":"XAUUSD"}"#,
            r#"{"symbol":"XAUUSD"}"#,
        ] {
            assert!(matches!(decode(body, now), Err(BridgeError::MalformedSignal(_))), "{}", body);
        }
    }

    #[test]
    fn test_torn_and_empty_files_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let torn = reader(&dir, Some(r#"{"action":"OPEN","symbol":"XAU"#));
        assert!(matches!(torn.read(), Err(BridgeError::MalformedSignal(_))));
        let empty = reader(&dir, Some(""));
        assert!(matches!(empty.read(), Err(BridgeError::MalformedSignal(_))));
    }

    #[test]
    fn test_stale_signal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let old = (Utc::now() - chrono::Duration::seconds(600)).timestamp();
        let body = format!(r#"{{"action":"CLOSE","symbol":"XAUUSD","issued_at":{}}}"#, old);
        let err = reader(&dir, Some(&body)).read().unwrap_err();
        assert!(matches!(err, BridgeError::StaleSignal { max_age_secs: 120, .. }));
    }
}
