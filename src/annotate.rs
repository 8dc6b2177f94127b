use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;

use crate::classify::QuestionResult;
use crate::layout::{AnswerKey, LayoutConfig};
use crate::region::bubble_center;

pub const CORRECT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const INCORRECT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Where the right answer was, for rows the student got wrong
pub const KEY_COLOR: Rgb<u8> = Rgb([120, 120, 120]);
pub const MARKER_RADIUS: i32 = 10;

const ANNOTATED_PREFIX: &str = "checked_";

/// Draw a 2 px ring centered on a bubble
fn draw_marker(canvas: &mut RgbImage, center: (i32, i32), color: Rgb<u8>) {
    draw_hollow_circle_mut(canvas, center, MARKER_RADIUS, color);
    draw_hollow_circle_mut(canvas, center, MARKER_RADIUS + 1, color);
}

/// Score detected answers against the key and draw feedback markers
///
/// Returns the number of correct answers. A detected letter without a key
/// entry is drawn as incorrect and never credited. With `reveal_missed`,
/// rows with no readable mark also get the key marker.
pub fn score_and_annotate(
    results: &BTreeMap<u32, QuestionResult>,
    layout: &LayoutConfig,
    key: Option<&AnswerKey>,
    canvas: &mut RgbImage,
    reveal_missed: bool,
) -> u32 {
    let mut correct = 0;

    for (&question, result) in results {
        let expected = key.and_then(|k| k.get(question));

        let Some(detected) = result.answer() else {
            if reveal_missed {
                if let Some(pos) = expected.and_then(|a| bubble_center(layout, question, a)) {
                    draw_marker(canvas, pos, KEY_COLOR);
                }
            }
            continue;
        };

        // Marker positions come straight from the layout, not from the crop
        let Some(detected_pos) = bubble_center(layout, question, detected) else {
            continue;
        };

        match expected {
            Some(answer) if answer == detected => {
                draw_marker(canvas, detected_pos, CORRECT_COLOR);
                correct += 1;
            }
            Some(answer) => {
                draw_marker(canvas, detected_pos, INCORRECT_COLOR);
                if let Some(key_pos) = bubble_center(layout, question, answer) {
                    draw_marker(canvas, key_pos, KEY_COLOR);
                }
            }
            None => draw_marker(canvas, detected_pos, INCORRECT_COLOR),
        }
    }

    correct
}

/// `dir/sheet.png` -> `dir/checked_sheet.png`
pub fn annotated_path(input: &Path) -> PathBuf {
    let name = input.file_name().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}{}", ANNOTATED_PREFIX, name))
}
