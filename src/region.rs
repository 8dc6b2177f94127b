use image::{GenericImageView, GrayImage, SubImage};

use crate::columns::{ColumnBounds, PixelRect};
use crate::labels::Answer;
use crate::layout::LayoutConfig;

/// Padding around the A..E bubble strip, as a multiple of the bubble radius
const PADDING_RADII: f64 = 1.4;
const OPTIONS_PER_ROW: f64 = 5.0;
/// Marker coordinates are clamped to this range before drawing
const MARKER_COORD_LIMIT: f64 = 1_000_000.0;

/// Crop rectangle of one question row, clipped to the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    /// Vertical center of the bubble row, before clipping
    pub center_y: i64,
}

impl Region {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn view<'a>(&self, image: &'a GrayImage) -> SubImage<&'a GrayImage> {
        image.view(self.x1, self.y1, self.width(), self.height())
    }
}

/// Pixel position of a bubble center, `None` if its column has no origin
pub fn bubble_center(layout: &LayoutConfig, question: u32, answer: Answer) -> Option<(i32, i32)> {
    let (column, row) = layout.column_slot(question);
    let origin = layout.origin(column)?;
    let x = origin.x + answer.index() as f64 * layout.bubble_h_spacing;
    let y = origin.y + row as f64 * layout.bubble_v_spacing;
    let clamp = |v: f64| v.clamp(-MARKER_COORD_LIMIT, MARKER_COORD_LIMIT) as i32;
    Some((clamp(x), clamp(y)))
}

/// Crop rectangle for a question, or `None` when it cannot be placed
pub fn map_region(
    question: u32,
    layout: &LayoutConfig,
    bounds: &ColumnBounds,
    image_size: (u32, u32),
) -> Option<Region> {
    let (column, row) = layout.column_slot(question);
    let origin = layout.origin(column)?;

    let center_y = (origin.y + row as f64 * layout.bubble_v_spacing) as i64;
    let x_first = origin.x as i64;
    let x_last = (origin.x + (OPTIONS_PER_ROW - 1.0) * layout.bubble_h_spacing) as i64;
    let padding = (layout.bubble_radius * PADDING_RADII) as i64;

    let mut rect = PixelRect {
        x1: x_first.saturating_sub(padding),
        y1: center_y.saturating_sub(padding),
        x2: x_last.saturating_add(padding),
        y2: center_y.saturating_add(padding),
    };

    if let Some(column_rect) = bounds.get(column) {
        rect = rect.intersect(&column_rect);
    }

    let (width, height) = (image_size.0 as i64, image_size.1 as i64);
    rect = rect.intersect(&PixelRect {
        x1: 0,
        y1: 0,
        x2: width,
        y2: height,
    });

    if rect.x2 <= rect.x1 || rect.y2 <= rect.y1 {
        return None;
    }

    Some(Region {
        x1: rect.x1 as u32,
        y1: rect.y1 as u32,
        x2: rect.x2 as u32,
        y2: rect.y2 as u32,
        center_y,
    })
}
