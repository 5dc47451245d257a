use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    #[error("Stale signal: issued {age_secs}s ago (max {max_age_secs}s)")]
    StaleSignal { age_secs: i64, max_age_secs: u64 },

    #[error("Perception insufficient: {0}")]
    PerceptionInsufficient(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution verification failed: {0}")]
    ExecutionVerificationFailed(String),

    #[error("Step {index} failed: {reason}")]
    Step { index: usize, reason: String },

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("Execution record store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Transport hiccups get a bounded in-cycle retry; everything else is
    /// re-evaluated on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::DeviceUnavailable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::MalformedSignal(_) => "malformed_signal",
            BridgeError::StaleSignal { .. } => "stale_signal",
            BridgeError::PerceptionInsufficient(_) => "perception_insufficient",
            BridgeError::DeviceUnavailable(_) => "device_unavailable",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::ExecutionVerificationFailed(_) => "execution_verification_failed",
            BridgeError::Step { .. } => "step_failed",
            BridgeError::Ocr(_) => "ocr",
            BridgeError::Store(_) => "store",
            BridgeError::Io(_) => "io",
            BridgeError::Config(_) => "config",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(BridgeError::Timeout("dump".into()).is_retryable());
        assert!(BridgeError::DeviceUnavailable("emulator-5554".into()).is_retryable());
        assert!(!BridgeError::MalformedSignal("eof".into()).is_retryable());
        assert!(!BridgeError::Step { index: 2, reason: "x".into() }.is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        let stale = BridgeError::StaleSignal { age_secs: 400, max_age_secs: 120 };
        assert_eq!(stale.kind(), "stale_signal");
        assert!(stale.to_string().contains("400s"));
    }
}
