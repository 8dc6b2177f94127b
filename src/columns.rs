use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::layout::{LayoutConfig, Origin};

/// Detector class id for a block of question rows
pub const QUESTION_COLUMN_CLASS: u32 = 0;
/// Boxes at or below this confidence are ignored
pub const MIN_COLUMN_CONFIDENCE: f32 = 0.30;
/// Displacement from a detected box corner to the first bubble center
pub const BOX_TO_BUBBLE_OFFSET: (i32, i32) = (20, 21);
/// Shrink applied to box-height / rows so the last row stays inside the box
const V_SPACING_SHRINK: f64 = 0.98;

/// Raw detector output box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: u32,
    pub confidence: f32,
}

/// Axis-aligned integer rectangle, corners inclusive-exclusive like slice ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl PixelRect {
    pub fn height(&self) -> i64 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn intersect(&self, other: &PixelRect) -> PixelRect {
        PixelRect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
    }
}

impl From<&DetectionBox> for PixelRect {
    fn from(b: &DetectionBox) -> Self {
        // Truncate like an int cast of the detector's float corners
        PixelRect {
            x1: b.x1 as i64,
            y1: b.y1 as i64,
            x2: b.x2 as i64,
            y2: b.y2 as i64,
        }
    }
}

/// Per-column clipping rectangles found by the detector for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBounds([Option<PixelRect>; 2]);

impl ColumnBounds {
    pub fn get(&self, column: usize) -> Option<PixelRect> {
        self.0.get(column).copied().flatten()
    }

    pub fn set(&mut self, column: usize, rect: PixelRect) {
        if let Some(slot) = self.0.get_mut(column) {
            *slot = Some(rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

/// An object detector that finds question columns on a canonical sheet image
pub trait ColumnDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectionBox>>;
}

/// Detector that replays boxes produced elsewhere, e.g. by an offline model run
#[derive(Debug, Clone, Default)]
pub struct PrecomputedDetector {
    boxes: Vec<DetectionBox>,
}

impl PrecomputedDetector {
    pub fn new(boxes: Vec<DetectionBox>) -> Self {
        Self { boxes }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read detections: {:?}", path))?;
        let boxes: Vec<DetectionBox> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse detections: {:?}", path))?;
        Ok(Self::new(boxes))
    }
}

impl ColumnDetector for PrecomputedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<DetectionBox>> {
        Ok(self.boxes.clone())
    }
}

/// Keep confident question-column boxes, ordered left to right
fn question_columns(boxes: &[DetectionBox]) -> Vec<PixelRect> {
    let mut columns: Vec<PixelRect> = boxes
        .iter()
        .filter(|b| b.class_id == QUESTION_COLUMN_CLASS && b.confidence > MIN_COLUMN_CONFIDENCE)
        .map(PixelRect::from)
        .collect();
    columns.sort_by_key(|r| r.x1);
    columns
}

fn origin_from_box(rect: &PixelRect) -> Origin {
    Origin::new(
        rect.x1.saturating_add(BOX_TO_BUBBLE_OFFSET.0 as i64) as f64,
        rect.y1.saturating_add(BOX_TO_BUBBLE_OFFSET.1 as i64) as f64,
    )
}

/// Apply detected columns to a layout
///
/// Leftmost box drives column 0, rightmost (when there are two or more)
/// drives column 1. Once any column is found the vertical spacing is always
/// recomputed from the average box height, even if the caller set it.
pub fn apply_detections(
    layout: &LayoutConfig,
    boxes: &[DetectionBox],
) -> (LayoutConfig, ColumnBounds) {
    let mut bounds = ColumnBounds::default();
    let columns = question_columns(boxes);

    let picked: Vec<&PixelRect> = match columns.as_slice() {
        [] => return (layout.clone(), bounds),
        [only] => vec![only],
        [first, .., last] => vec![first, last],
    };

    let mut updated = layout.clone();
    for (column, rect) in picked.iter().enumerate() {
        updated.column_origins[column] = Some(origin_from_box(rect));
        bounds.set(column, **rect);
    }

    let mean_height =
        picked.iter().map(|r| r.height() as f64).sum::<f64>() / picked.len() as f64;
    if updated.questions_per_column > 0 {
        updated.bubble_v_spacing =
            mean_height / updated.questions_per_column as f64 * V_SPACING_SHRINK;
    }

    (updated, bounds)
}

/// Refine a layout with an optional detector
///
/// Bounds are always fresh for the call. Detector failures are logged and
/// leave the layout untouched.
pub fn refine_with_detector(
    canonical: &RgbImage,
    layout: &LayoutConfig,
    detector: Option<&mut (dyn ColumnDetector + '_)>,
) -> (LayoutConfig, ColumnBounds) {
    let Some(detector) = detector else {
        return (layout.clone(), ColumnBounds::default());
    };

    match detector.detect(canonical) {
        Ok(boxes) => {
            let (updated, bounds) = apply_detections(layout, &boxes);
            if bounds.is_empty() {
                tracing::debug!("Detector found no question columns; keeping layout origins");
            } else {
                tracing::debug!(
                    "Detector columns: {:?}, v spacing {:.2}",
                    updated.column_origins,
                    updated.bubble_v_spacing
                );
            }
            (updated, bounds)
        }
        Err(err) => {
            tracing::warn!("Column detector failed: {:#}", err);
            (layout.clone(), ColumnBounds::default())
        }
    }
}
