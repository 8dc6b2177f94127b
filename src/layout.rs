use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::labels::Answer;

/// Question count assumed when neither the layout nor the key says otherwise
pub const DEFAULT_TOTAL_QUESTIONS: u32 = 30;
pub const DEFAULT_BUBBLE_RADIUS: f64 = 6.0;
/// Largest spacing, radius or origin coordinate accepted from a caller
pub const MAX_LAYOUT_EXTENT: f64 = 8000.0;

/// Pixel coordinate of the first bubble center (option A of the first row) in a column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Origin {
    pub x: f64,
    pub y: f64,
}

impl Origin {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// (0, 0) is what sheet editors send for "not configured"
    pub fn is_set(&self) -> bool {
        !(self.x == 0.0 && self.y == 0.0)
    }
}

impl From<[f64; 2]> for Origin {
    fn from(xy: [f64; 2]) -> Self {
        Self::new(xy[0], xy[1])
    }
}

impl From<Origin> for [f64; 2] {
    fn from(origin: Origin) -> Self {
        [origin.x, origin.y]
    }
}

/// Layout as supplied by the caller; any subset of fields may be present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutHints {
    pub total_questions: Option<u32>,
    pub questions_per_column: Option<u32>,
    pub bubble_h_spacing: Option<f64>,
    pub bubble_v_spacing: Option<f64>,
    pub bubble_radius: Option<f64>,
    pub column1_origin: Option<Origin>,
    pub column2_origin: Option<Origin>,
}

/// Fully resolved sheet layout, in canonical-frame pixels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutConfig {
    pub total_questions: u32,
    pub questions_per_column: u32,
    pub bubble_h_spacing: f64,
    pub bubble_v_spacing: f64,
    pub bubble_radius: f64,
    pub column_origins: [Option<Origin>; 2],
}

impl LayoutConfig {
    /// Column index and row within that column for a 1-based question number
    pub fn column_slot(&self, question: u32) -> (usize, u32) {
        if question <= self.questions_per_column {
            (0, question.saturating_sub(1))
        } else {
            (1, question - self.questions_per_column - 1)
        }
    }

    /// Reject geometry far outside the canonical frame
    pub fn check_extent(&self) -> Result<(), String> {
        let scalars = [
            ("bubble_h_spacing", self.bubble_h_spacing),
            ("bubble_v_spacing", self.bubble_v_spacing),
            ("bubble_radius", self.bubble_radius),
        ];
        for (name, value) in scalars {
            if value > MAX_LAYOUT_EXTENT {
                return Err(format!("{} {} exceeds {}", name, value, MAX_LAYOUT_EXTENT));
            }
        }

        for (column, origin) in self.column_origins.iter().enumerate() {
            if let Some(o) = origin {
                if !(o.x.is_finite() && o.y.is_finite())
                    || o.x.abs() > MAX_LAYOUT_EXTENT
                    || o.y.abs() > MAX_LAYOUT_EXTENT
                {
                    return Err(format!(
                        "column{}_origin ({}, {}) is outside +/-{}",
                        column + 1,
                        o.x,
                        o.y,
                        MAX_LAYOUT_EXTENT
                    ));
                }
            }
        }

        Ok(())
    }

    /// Origin of a column, `None` when unset or left at (0, 0)
    pub fn origin(&self, column: usize) -> Option<Origin> {
        self.column_origins
            .get(column)
            .copied()
            .flatten()
            .filter(Origin::is_set)
    }
}

/// Default geometry for a given question count: (per column, h spacing, v spacing)
fn defaults_for(total_questions: u32) -> (u32, f64, f64) {
    match total_questions {
        28 => (14, 32.0, 27.0),
        32 => (16, 28.0, 26.0),
        _ => (15, 30.0, 26.0),
    }
}

fn positive_u32(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

fn positive_f64(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Fill every missing layout field from the defaults for the question count
///
/// Caller-supplied fields always win. Zero or non-positive values count as
/// missing.
pub fn resolve_layout(hints: &LayoutHints, key: Option<&AnswerKey>) -> LayoutConfig {
    let total_questions = positive_u32(hints.total_questions)
        .or_else(|| key.and_then(AnswerKey::highest_question))
        .unwrap_or(DEFAULT_TOTAL_QUESTIONS);

    let (per_column, h_spacing, v_spacing) = defaults_for(total_questions);

    LayoutConfig {
        total_questions,
        questions_per_column: positive_u32(hints.questions_per_column).unwrap_or(per_column),
        bubble_h_spacing: positive_f64(hints.bubble_h_spacing).unwrap_or(h_spacing),
        bubble_v_spacing: positive_f64(hints.bubble_v_spacing).unwrap_or(v_spacing),
        bubble_radius: positive_f64(hints.bubble_radius).unwrap_or(DEFAULT_BUBBLE_RADIUS),
        column_origins: [hints.column1_origin, hints.column2_origin],
    }
}

/// Expected answer per question; questions may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct AnswerKey(BTreeMap<u32, Answer>);

impl AnswerKey {
    pub fn get(&self, question: u32) -> Option<Answer> {
        self.0.get(&question).copied()
    }

    pub fn insert(&mut self, question: u32, answer: Answer) {
        self.0.insert(question, answer);
    }

    pub fn highest_question(&self) -> Option<u32> {
        self.0.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, Answer)> for AnswerKey {
    fn from_iter<I: IntoIterator<Item = (u32, Answer)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for AnswerKey {
    fn from(raw: BTreeMap<String, String>) -> Self {
        let mut key = AnswerKey::default();
        for (question, letter) in raw {
            let Ok(number) = question.trim().parse::<u32>() else {
                tracing::warn!("Ignoring answer key entry with non-numeric question '{}'", question);
                continue;
            };
            match letter.parse::<Answer>() {
                Ok(answer) if number > 0 => key.insert(number, answer),
                Ok(_) => tracing::warn!("Ignoring answer key entry for question 0"),
                Err(err) => tracing::warn!("Ignoring answer key entry for question {}: {}", number, err),
            }
        }
        key
    }
}
