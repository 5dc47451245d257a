//! Fallback-chained perception: UI tree first, OCR only when the tree gave
//! nothing usable.

use crate::markers::MarkerSet;
use crate::model::{Layout, Observation, Perceived, PerceptionSource, ScreenState};
use crate::ocr::{self, OcrEngine};
use crate::profile::Region;
use crate::retry::{with_retry, RetryConfig};
use crate::structured;
use crate::transport::Transport;
use crate::ui_tree::parse_dump;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Perceiver {
    transport: Arc<dyn Transport>,
    ocr: Arc<dyn OcrEngine>,
    markers: MarkerSet,
    ocr_region: Option<Region>,
    ocr_cap: f32,
    retry: RetryConfig,
}

impl Perceiver {
    pub fn new(
        transport: Arc<dyn Transport>,
        ocr: Arc<dyn OcrEngine>,
        markers: MarkerSet,
        ocr_region: Option<Region>,
        ocr_cap: f32,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            ocr,
            markers,
            ocr_region,
            ocr_cap,
            retry,
        }
    }

    /// One full perception pass. Never fails: an unreadable screen is an
    /// `Observation::Unusable` carrying every strategy's reason, alongside
    /// whatever labels either strategy could still place.
    pub async fn observe(&self, device: &str) -> (Observation, Layout) {
        let mut reasons = Vec::with_capacity(2);

        let structured = self.structured(device).await;
        let structured_layout = match structured.state {
            Ok(state) => return accepted(state, structured.layout),
            Err(unusable) => {
                debug!(device, reason = %unusable.reason, "structured perception unusable, falling back to OCR");
                reasons.push(unusable);
                structured.layout
            }
        };

        let optical = self.optical(device).await;
        let layout = match optical.state {
            Ok(state) => return accepted(state, optical.layout),
            Err(unusable) => {
                reasons.push(unusable);
                if structured_layout.labels.is_empty() {
                    optical.layout
                } else {
                    structured_layout
                }
            }
        };

        info!(
            device,
            structured = %reasons[0].reason,
            ocr = %reasons[reasons.len() - 1].reason,
            labels = layout.labels.len(),
            "perception failed"
        );
        (Observation::Unusable(reasons), layout)
    }

    async fn structured(&self, device: &str) -> Perceived {
        let unusable = |reason: String| Perceived::unusable(PerceptionSource::Structured, reason);
        let xml = match with_retry(&self.retry, "ui snapshot", || self.transport.fetch_ui_snapshot(device)).await {
            Ok(xml) => xml,
            Err(e) => return unusable(e.to_string()),
        };
        match parse_dump(&xml) {
            Ok(tree) => structured::parse(&tree, &self.markers),
            Err(e) => unusable(e.to_string()),
        }
    }

    async fn optical(&self, device: &str) -> Perceived {
        let unusable = |reason: String| Perceived::unusable(PerceptionSource::Ocr, reason);
        let png = match with_retry(&self.retry, "screenshot", || self.transport.fetch_screenshot(device)).await {
            Ok(png) => png,
            Err(e) => return unusable(e.to_string()),
        };
        let words = match self.ocr.recognize(&png).await {
            Ok(words) => words,
            Err(e) => return unusable(e.to_string()),
        };
        ocr::parse(
            &words,
            ocr::capture_size(&png),
            self.ocr_region,
            &self.markers,
            self.ocr_cap,
        )
    }
}

fn accepted(state: ScreenState, layout: Layout) -> (Observation, Layout) {
    debug!(
        source = state.perception_source.as_str(),
        confidence = state.confidence,
        positions = state.open_positions.len(),
        dialogs = state.pending_dialogs.len(),
        "screen perceived"
    );
    (Observation::Screen(state), layout)
}
