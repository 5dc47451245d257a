use crate::error::{BridgeError, BridgeResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved runtime settings. Core components only ever see this struct;
/// where the values came from (`.env`, process env, tests) stays here.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub adb_path: String,
    /// `host:port` of a remote adb server, passed as `-H`/`-P`.
    pub adb_server: Option<(String, u16)>,
    /// Explicit device serials; empty means every attached device.
    pub devices: Vec<String>,
    pub poll_interval: Duration,
    pub signal_path: PathBuf,
    pub state_dir: PathBuf,
    pub profile_path: Option<PathBuf>,
    pub signal_max_age: Duration,
    pub structured_min_confidence: f32,
    pub ocr_min_confidence: f32,
    pub ocr_confidence_cap: f32,
    pub transport_timeout: Duration,
    pub transport_retries: usize,
    pub step_timeout: Duration,
    pub cycle_timeout: Duration,
    pub settle: Duration,
    pub max_attempts: u32,
    pub startup_retries: usize,
    pub tesseract_path: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let base = default_bridge_dir();
        Self {
            adb_path: "adb".to_string(),
            adb_server: None,
            devices: Vec::new(),
            poll_interval: Duration::from_millis(1500),
            signal_path: base.join("signal.json"),
            state_dir: base.join("state"),
            profile_path: None,
            signal_max_age: Duration::from_secs(120),
            structured_min_confidence: 0.9,
            ocr_min_confidence: 0.7,
            ocr_confidence_cap: 0.85,
            transport_timeout: Duration::from_millis(8000),
            transport_retries: 2,
            step_timeout: Duration::from_millis(5000),
            cycle_timeout: Duration::from_millis(20000),
            settle: Duration::from_millis(800),
            max_attempts: 3,
            startup_retries: 5,
            tesseract_path: "tesseract".to_string(),
        }
    }
}

fn default_bridge_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bridge")
}

impl BridgeConfig {
    /// Load `.env` (if any) and overlay the process environment.
    pub fn from_env() -> BridgeResult<Self> {
        dotenv::dotenv().ok();
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = BridgeConfig::default();

        if let Some(v) = get("ADB_PATH") {
            cfg.adb_path = v;
        }
        if let Some(v) = get("BRIDGE_ADB_SERVER") {
            cfg.adb_server = Some(parse_endpoint(&v)?);
        }
        if let Some(v) = get("BRIDGE_DEVICES") {
            cfg.devices = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("POLL_SECONDS") {
            let secs: f64 = parse_num("POLL_SECONDS", &v)?;
            if !(secs > 0.0) {
                return Err(BridgeError::Config("POLL_SECONDS must be > 0".into()));
            }
            cfg.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(v) = get("BRIDGE_SIGNAL_PATH") {
            cfg.signal_path = PathBuf::from(v);
        }
        if let Some(v) = get("BRIDGE_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BRIDGE_PROFILE_PATH") {
            cfg.profile_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BRIDGE_SIGNAL_MAX_AGE_SECS") {
            cfg.signal_max_age = Duration::from_secs(parse_num("BRIDGE_SIGNAL_MAX_AGE_SECS", &v)?);
        }
        if let Some(v) = get("BRIDGE_STRUCTURED_MIN_CONFIDENCE") {
            cfg.structured_min_confidence = parse_unit("BRIDGE_STRUCTURED_MIN_CONFIDENCE", &v)?;
        }
        if let Some(v) = get("BRIDGE_OCR_MIN_CONFIDENCE") {
            cfg.ocr_min_confidence = parse_unit("BRIDGE_OCR_MIN_CONFIDENCE", &v)?;
        }
        if let Some(v) = get("BRIDGE_OCR_CONFIDENCE_CAP") {
            cfg.ocr_confidence_cap = parse_unit("BRIDGE_OCR_CONFIDENCE_CAP", &v)?;
        }
        if let Some(v) = get("BRIDGE_TRANSPORT_TIMEOUT_MS") {
            cfg.transport_timeout = parse_millis("BRIDGE_TRANSPORT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("BRIDGE_TRANSPORT_RETRIES") {
            cfg.transport_retries = parse_num("BRIDGE_TRANSPORT_RETRIES", &v)?;
        }
        if let Some(v) = get("BRIDGE_STEP_TIMEOUT_MS") {
            cfg.step_timeout = parse_millis("BRIDGE_STEP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("BRIDGE_CYCLE_TIMEOUT_MS") {
            cfg.cycle_timeout = parse_millis("BRIDGE_CYCLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("BRIDGE_SETTLE_MS") {
            cfg.settle = Duration::from_millis(parse_num("BRIDGE_SETTLE_MS", &v)?);
        }
        if let Some(v) = get("BRIDGE_MAX_ATTEMPTS") {
            cfg.max_attempts = parse_num("BRIDGE_MAX_ATTEMPTS", &v)?;
            if cfg.max_attempts == 0 {
                return Err(BridgeError::Config("BRIDGE_MAX_ATTEMPTS must be >= 1".into()));
            }
        }
        if let Some(v) = get("BRIDGE_STARTUP_RETRIES") {
            cfg.startup_retries = parse_num("BRIDGE_STARTUP_RETRIES", &v)?;
        }
        if let Some(v) = get("TESSERACT_PATH") {
            cfg.tesseract_path = v;
        }

        if cfg.ocr_min_confidence > cfg.ocr_confidence_cap {
            return Err(BridgeError::Config(format!(
                "BRIDGE_OCR_MIN_CONFIDENCE ({}) is above BRIDGE_OCR_CONFIDENCE_CAP ({}); OCR could never act",
                cfg.ocr_min_confidence, cfg.ocr_confidence_cap
            )));
        }

        if cfg.ocr_confidence_cap >= cfg.structured_min_confidence {
            return Err(BridgeError::Config(format!(
                "BRIDGE_OCR_CONFIDENCE_CAP ({}) must stay below BRIDGE_STRUCTURED_MIN_CONFIDENCE ({})",
                cfg.ocr_confidence_cap, cfg.structured_min_confidence
            )));
        }

        Ok(cfg)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> BridgeResult<T> {
    raw.parse::<T>()
        .map_err(|_| BridgeError::Config(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_millis(key: &str, raw: &str) -> BridgeResult<Duration> {
    let ms: u64 = parse_num(key, raw)?;
    if ms == 0 {
        return Err(BridgeError::Config(format!("{} must be > 0", key)));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_unit(key: &str, raw: &str) -> BridgeResult<f32> {
    let v: f32 = parse_num(key, raw)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(BridgeError::Config(format!("{} must be within 0..=1, got {}", key, v)));
    }
    Ok(v)
}

fn parse_endpoint(raw: &str) -> BridgeResult<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| BridgeError::Config(format!("BRIDGE_ADB_SERVER '{}' is not host:port", raw)))?;
    if host.is_empty() {
        return Err(BridgeError::Config("BRIDGE_ADB_SERVER host is empty".into()));
    }
    Ok((host.to_string(), parse_num("BRIDGE_ADB_SERVER", port)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_from(pairs: &[(&str, &str)]) -> BridgeResult<BridgeConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = cfg_from(&[]).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(1500));
        assert_eq!(cfg.adb_path, "adb");
        assert!(cfg.devices.is_empty());
        assert!(cfg.ocr_confidence_cap < cfg.structured_min_confidence);
    }

    #[test]
    fn test_overrides() {
        let cfg = cfg_from(&[
            ("POLL_SECONDS", "0.5"),
            ("BRIDGE_DEVICES", "emulator-5554, emulator-5556,"),
            ("BRIDGE_ADB_SERVER", "10.0.2.2:5037"),
            ("BRIDGE_STRUCTURED_MIN_CONFIDENCE", "0.95"),
        ])
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.devices, vec!["emulator-5554", "emulator-5556"]);
        assert_eq!(cfg.adb_server, Some(("10.0.2.2".to_string(), 5037)));
        assert!((cfg.structured_min_confidence - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_ocr_cap_must_stay_below_structured_threshold() {
        for cap in ["1.0", "0.9"] {
            assert!(matches!(
                cfg_from(&[("BRIDGE_OCR_CONFIDENCE_CAP", cap)]),
                Err(BridgeError::Config(_))
            ));
        }
        let cfg = cfg_from(&[
            ("BRIDGE_OCR_CONFIDENCE_CAP", "0.9"),
            ("BRIDGE_STRUCTURED_MIN_CONFIDENCE", "0.95"),
        ])
        .unwrap();
        assert!((cfg.ocr_confidence_cap - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        assert!(matches!(cfg_from(&[("POLL_SECONDS", "fast")]), Err(BridgeError::Config(_))));
        assert!(matches!(cfg_from(&[("POLL_SECONDS", "0")]), Err(BridgeError::Config(_))));
        assert!(matches!(
            cfg_from(&[("BRIDGE_OCR_MIN_CONFIDENCE", "1.5")]),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            cfg_from(&[("BRIDGE_OCR_MIN_CONFIDENCE", "0.9"), ("BRIDGE_OCR_CONFIDENCE_CAP", "0.8")]),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(cfg_from(&[("BRIDGE_ADB_SERVER", "nohost")]), Err(BridgeError::Config(_))));
    }
}
