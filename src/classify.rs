use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{GenericImageView, GrayImage, SubImage};
use nalgebra::{DMatrix, DVector};
use serde::{Serialize, Serializer};

use crate::columns::ColumnBounds;
use crate::labels::{Answer, Label, LabelMap};
use crate::layout::LayoutConfig;
use crate::region::{map_region, Region};

/// Classifier input shape (columns x rows)
pub const CLASSIFIER_INPUT_WIDTH: usize = 150;
pub const CLASSIFIER_INPUT_HEIGHT: usize = 32;
/// Regions must be larger than this on both sides to be classified
pub const MIN_REGION_SIDE: u32 = 5;
/// Foreground pixels a strip needs before it counts as marked
pub const MARK_PIXEL_THRESHOLD: u32 = 50;

/// Outcome for a single question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionResult {
    Marked(Answer),
    Empty,
    Error,
    Unknown,
}

impl QuestionResult {
    pub fn answer(&self) -> Option<Answer> {
        match self {
            QuestionResult::Marked(answer) => Some(*answer),
            _ => None,
        }
    }
}

impl fmt::Display for QuestionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionResult::Marked(answer) => write!(f, "{}", answer),
            QuestionResult::Empty => write!(f, "EMPTY"),
            QuestionResult::Error => write!(f, "ERROR"),
            QuestionResult::Unknown => write!(f, "UNK"),
        }
    }
}

impl Serialize for QuestionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A model that scores normalized question crops
///
/// Each input is a `CLASSIFIER_INPUT_HEIGHT x CLASSIFIER_INPUT_WIDTH` matrix of
/// intensities in [0, 1]. Implementations return one probability vector per
/// input, in input order.
pub trait Classifier {
    fn predict(&mut self, batch: &[DMatrix<f32>]) -> Result<Vec<DVector<f32>>>;
}

/// What to do with a batch when the classifier call fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BatchFailurePolicy {
    /// Drop the whole batch and read every question by pixel counting
    #[default]
    DiscardBatch,
    /// Ask the classifier again one question at a time, pixel counting only
    /// the questions whose own call fails
    RetryIndividually,
}

/// Resize a crop to the classifier input shape and scale it to [0, 1]
pub fn normalize_crop(crop: &SubImage<&GrayImage>) -> Result<DMatrix<f32>> {
    let (width, height) = crop.dimensions();
    if width == 0 || height == 0 {
        bail!("Cannot normalize an empty {}x{} crop", width, height);
    }

    let resized = imageops::resize(
        &crop.to_image(),
        CLASSIFIER_INPUT_WIDTH as u32,
        CLASSIFIER_INPUT_HEIGHT as u32,
        FilterType::Triangle,
    );

    Ok(DMatrix::from_fn(
        CLASSIFIER_INPUT_HEIGHT,
        CLASSIFIER_INPUT_WIDTH,
        |row, col| resized.get_pixel(col as u32, row as u32)[0] as f32 / 255.0,
    ))
}

/// Count foreground pixels in equal-width vertical strips, one per option
///
/// Strip width is `width / 5` rounded down; leftover columns on the right are
/// not counted.
pub fn strip_counts(crop: &SubImage<&GrayImage>) -> [u32; 5] {
    let (width, height) = crop.dimensions();
    let step = width / Answer::ALL.len() as u32;
    let mut counts = [0u32; 5];

    for (strip, count) in counts.iter_mut().enumerate() {
        let x_start = strip as u32 * step;
        for x in x_start..x_start + step {
            for y in 0..height {
                if crop.get_pixel(x, y)[0] != 0 {
                    *count += 1;
                }
            }
        }
    }

    counts
}

/// Pick the most filled strip if it clears the threshold, lowest index on ties
pub fn decide_from_counts(counts: &[u32; 5], threshold: u32) -> QuestionResult {
    let mut best = 0;
    for (i, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = i;
        }
    }

    if counts[best] > threshold {
        Answer::from_index(best).map_or(QuestionResult::Empty, QuestionResult::Marked)
    } else {
        QuestionResult::Empty
    }
}

/// Deterministic reading used when no classifier result is available
pub fn pixel_fallback(crop: &SubImage<&GrayImage>) -> QuestionResult {
    decide_from_counts(&strip_counts(crop), MARK_PIXEL_THRESHOLD)
}

/// Map a probability vector to a result through the label map
pub fn decode_prediction(probabilities: &DVector<f32>, labels: &LabelMap) -> QuestionResult {
    if probabilities.is_empty() {
        return QuestionResult::Unknown;
    }

    let (index, _) = probabilities.argmax();
    match labels.get(index) {
        Some(Label::Marked(answer)) => QuestionResult::Marked(answer),
        Some(Label::NoneMarked) => QuestionResult::Empty,
        None => QuestionResult::Unknown,
    }
}

fn run_classifier(
    classifier: &mut (dyn Classifier + '_),
    batch: &[DMatrix<f32>],
) -> Result<Vec<DVector<f32>>> {
    let predictions = classifier.predict(batch)?;
    if predictions.len() != batch.len() {
        bail!(
            "Classifier returned {} predictions for {} inputs",
            predictions.len(),
            batch.len()
        );
    }
    Ok(predictions)
}

/// A question that made it into the classifier batch
struct Pending {
    question: u32,
    region: Region,
}

/// Classify every question of the sheet
///
/// Never fails: every question from 1 to `total_questions` gets exactly one
/// result.
pub fn classify_questions(
    binary: &GrayImage,
    layout: &LayoutConfig,
    bounds: &ColumnBounds,
    classifier: Option<&mut (dyn Classifier + '_)>,
    labels: &LabelMap,
    policy: BatchFailurePolicy,
) -> BTreeMap<u32, QuestionResult> {
    let mut results = BTreeMap::new();
    let mut pending: Vec<Pending> = Vec::new();
    let mut batch: Vec<DMatrix<f32>> = Vec::new();

    for question in 1..=layout.total_questions {
        let region = match map_region(question, layout, bounds, binary.dimensions()) {
            Some(r) if r.width() > MIN_REGION_SIDE && r.height() > MIN_REGION_SIDE => r,
            _ => {
                results.insert(question, QuestionResult::Empty);
                continue;
            }
        };

        match normalize_crop(&region.view(binary)) {
            Ok(input) => {
                batch.push(input);
                pending.push(Pending { question, region });
            }
            // Only an empty crop fails here, and the size filter above already rejects those
            Err(err) => {
                tracing::debug!("Question {}: {:#}", question, err);
                results.insert(question, QuestionResult::Error);
            }
        }
    }

    if pending.is_empty() {
        return results;
    }

    let fallback = |p: &Pending| pixel_fallback(&p.region.view(binary));

    let Some(classifier) = classifier else {
        for p in &pending {
            results.insert(p.question, fallback(p));
        }
        return results;
    };

    match run_classifier(classifier, &batch) {
        Ok(predictions) => {
            for (p, probabilities) in pending.iter().zip(&predictions) {
                results.insert(p.question, decode_prediction(probabilities, labels));
            }
        }
        Err(err) => {
            tracing::warn!(
                "Classifier failed on batch of {}: {:#}; falling back ({:?})",
                batch.len(),
                err,
                policy
            );
            for (p, input) in pending.iter().zip(&batch) {
                let result = match policy {
                    BatchFailurePolicy::DiscardBatch => fallback(p),
                    BatchFailurePolicy::RetryIndividually => {
                        match run_classifier(classifier, std::slice::from_ref(input)) {
                            Ok(predictions) => decode_prediction(&predictions[0], labels),
                            Err(err) => {
                                tracing::debug!("Question {} retry failed: {:#}", p.question, err);
                                fallback(p)
                            }
                        }
                    }
                };
                results.insert(p.question, result);
            }
        }
    }

    results
}
