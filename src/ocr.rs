//! OCR fallback perception: screenshot -> recognised words -> `ScreenState`.
//!
//! Only consulted when the UI tree gave nothing usable. Confidence is the
//! mean recognition score of the words that carried markers, capped by
//! configuration so OCR can never look as certain as the UI tree.

use crate::error::{BridgeError, BridgeResult};
use crate::markers::{Findings, MarkerSet, RowMatch};
use crate::model::{Bounds, LabelBox, Perceived, PerceptionSource};
use crate::profile::Region;
use async_trait::async_trait;
use image::GenericImageView;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captures narrower than this are upscaled before recognition.
const MIN_OCR_WIDTH: u32 = 1000;
/// Longest label phrase resolvable from OCR lines.
const MAX_LABEL_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub bounds: Bounds,
    /// 0..=1
    pub score: f32,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognise words in a PNG capture. Boxes are in capture pixels.
    async fn recognize(&self, png: &[u8]) -> BridgeResult<Vec<OcrWord>>;
}

// =====================================================
// TESSERACT CLI
// =====================================================

pub struct TesseractCli {
    path: String,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }

    /// Grayscale and upscale small captures. Returns the PNG to feed the
    /// engine and the factor applied.
    fn prepare(png: &[u8]) -> BridgeResult<(Vec<u8>, f32)> {
        let img = image::load_from_memory(png)
            .map_err(|e| BridgeError::Ocr(format!("screenshot is not a readable image: {}", e)))?;
        let (w, h) = img.dimensions();
        let scale = if w > 0 && w < MIN_OCR_WIDTH { 2.0 } else { 1.0 };
        let gray = img.grayscale();
        let prepared = if scale > 1.0 {
            gray.resize(
                (w as f32 * scale) as u32,
                (h as f32 * scale) as u32,
                image::imageops::FilterType::Triangle,
            )
        } else {
            gray
        };
        let mut buffer = Cursor::new(Vec::new());
        prepared
            .write_to(&mut buffer, image::ImageOutputFormat::Png)
            .map_err(|e| BridgeError::Ocr(format!("cannot encode capture: {}", e)))?;
        Ok((buffer.into_inner(), scale))
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&self, png: &[u8]) -> BridgeResult<Vec<OcrWord>> {
        let (prepared, scale) = Self::prepare(png)?;
        let input: PathBuf = std::env::temp_dir().join(format!("bridge_ocr_{}.png", uuid::Uuid::new_v4()));
        tokio::fs::write(&input, &prepared).await?;

        let run = Command::new(&self.path)
            .arg(&input)
            .arg("stdout")
            .arg("tsv")
            .kill_on_drop(true)
            .output();
        let result = tokio::time::timeout(self.timeout, run).await;
        let _ = tokio::fs::remove_file(&input).await;

        let output = match result {
            Err(_) => {
                return Err(BridgeError::Timeout(format!(
                    "tesseract exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
            Ok(Err(e)) => return Err(BridgeError::Ocr(format!("failed to run {}: {}", self.path, e))),
            Ok(Ok(out)) => out,
        };
        if !output.status.success() {
            return Err(BridgeError::Ocr(format!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let words = parse_tsv(&String::from_utf8_lossy(&output.stdout), scale);
        debug!(words = words.len(), "tesseract recognised words");
        Ok(words)
    }
}

/// Parse `tesseract ... tsv` output, keeping word rows (level 5) only and
/// mapping boxes back through `scale`.
pub fn parse_tsv(tsv: &str, scale: f32) -> Vec<OcrWord> {
    let scale = if scale > 0.0 { scale } else { 1.0 };
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<f32>().ok();
            let conf = num(10)?;
            let text = cols[11].trim();
            if text.is_empty() || conf < 0.0 {
                return None;
            }
            let (left, top, width, height) = (num(6)?, num(7)?, num(8)?, num(9)?);
            Some(OcrWord {
                text: text.to_string(),
                bounds: Bounds::new(
                    (left / scale) as i32,
                    (top / scale) as i32,
                    ((left + width) / scale) as i32,
                    ((top + height) / scale) as i32,
                ),
                score: (conf / 100.0).clamp(0.0, 1.0),
            })
        })
        .collect()
}

// =====================================================
// MARKER MATCHING OVER LINES
// =====================================================

#[derive(Debug, Clone)]
struct Line {
    words: Vec<OcrWord>,
    bounds: Bounds,
}

impl Line {
    fn text(&self) -> String {
        self.words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ")
    }

    fn height(&self) -> i32 {
        (self.bounds.bottom - self.bounds.top).max(1)
    }
}

/// Cluster words into text lines by vertical overlap, left to right.
fn group_lines(words: &[OcrWord]) -> Vec<Line> {
    let mut sorted: Vec<&OcrWord> = words.iter().collect();
    sorted.sort_by_key(|w| (w.bounds.top, w.bounds.left));

    let mut lines: Vec<Line> = Vec::new();
    for word in sorted {
        match lines.iter_mut().find(|l| l.bounds.vertical_overlap(&word.bounds) >= 0.5) {
            Some(line) => {
                line.bounds = line.bounds.union(&word.bounds);
                line.words.push(word.clone());
            }
            None => lines.push(Line {
                words: vec![word.clone()],
                bounds: word.bounds,
            }),
        }
    }
    for line in &mut lines {
        line.words.sort_by_key(|w| w.bounds.left);
    }
    lines.sort_by_key(|l| l.bounds.top);
    lines
}

fn in_region(bounds: &Bounds, region: Option<Region>, screen: Option<(u32, u32)>) -> bool {
    let (Some(r), Some((w, h))) = (region, screen) else {
        return true;
    };
    let (cx, cy) = bounds.center();
    let (fx, fy) = (cx as f32 / w.max(1) as f32, cy as f32 / h.max(1) as f32);
    fx >= r.left && fx <= r.right && fy >= r.top && fy <= r.bottom
}

fn label_boxes(lines: &[Line]) -> Vec<LabelBox> {
    let mut out = Vec::new();
    for line in lines {
        for n in 1..=MAX_LABEL_WORDS.min(line.words.len()) {
            for window in line.words.windows(n) {
                let bounds = window
                    .iter()
                    .skip(1)
                    .fold(window[0].bounds, |acc, w| acc.union(&w.bounds));
                out.push(LabelBox {
                    text: window.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "),
                    bounds,
                    clickable: false,
                });
            }
        }
    }
    out
}

/// Apply the shared markers to recognised words.
pub fn parse(
    words: &[OcrWord],
    screen: Option<(u32, u32)>,
    region: Option<Region>,
    markers: &MarkerSet,
    cap: f32,
) -> Perceived {
    if words.is_empty() {
        return Perceived::unusable(PerceptionSource::Ocr, "no text recognised");
    }

    let lines = group_lines(words);
    let mut findings = Findings {
        labels: label_boxes(&lines),
        ..Default::default()
    };
    let mut used_scores: Vec<f32> = Vec::new();

    for line in &lines {
        let text = line.text();
        if markers.mentions_positions_label(&text) {
            findings.positions_marker = true;
            used_scores.extend(line.words.iter().map(|w| w.score));
        }
        for kind in markers.dialogs_in(&text) {
            let Some(dismiss) = markers.dismiss_label(kind) else { continue };
            let visible = lines.iter().any(|l| {
                l.words.iter().any(|w| w.text.trim().to_lowercase() == dismiss)
                    || l.text().trim().to_lowercase() == dismiss
            });
            if visible {
                findings.dialogs.insert(kind);
                used_scores.extend(line.words.iter().map(|w| w.score));
            }
        }
    }

    // Rows: one line each, or a symbol-only line joined with the line right
    // under it when that line carries the side.
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if !in_region(&line.bounds, region, screen) || !markers.dialogs_in(&line.text()).is_empty() {
            i += 1;
            continue;
        }
        let mut matched = markers.match_row(&line.text());
        let mut bounds = line.bounds;
        let mut consumed = 1;
        if let RowMatch::Partial { .. } = matched {
            if let Some(next) = lines.get(i + 1) {
                let gap = next.bounds.top - line.bounds.bottom;
                if gap <= line.height()
                    && markers.symbols_in(&next.text()).is_empty()
                    && !markers.sides_in(&next.text()).is_empty()
                {
                    matched = markers.match_row(&format!("{} {}", line.text(), next.text()));
                    bounds = bounds.union(&next.bounds);
                    consumed = 2;
                }
            }
        }
        if matched != RowMatch::Nothing {
            for l in &lines[i..i + consumed] {
                used_scores.extend(l.words.iter().map(|w| w.score));
            }
            findings.record_row(matched, Some(bounds));
        }
        i += consumed;
    }

    let base = if used_scores.is_empty() {
        0.0
    } else {
        used_scores.iter().sum::<f32>() / used_scores.len() as f32
    };
    findings.into_perceived(PerceptionSource::Ocr, base, cap)
}

/// Pixel size of a PNG capture, if it decodes.
pub fn capture_size(png: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(png))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
