use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageReader, RgbImage};
use serde::Serialize;

use crate::annotate::{annotated_path, score_and_annotate};
use crate::classify::{classify_questions, BatchFailurePolicy, Classifier, QuestionResult};
use crate::columns::{refine_with_detector, ColumnDetector, PrecomputedDetector};
use crate::error::{GradeError, GradeResult};
use crate::labels::LabelMap;
use crate::layout::{resolve_layout, AnswerKey, LayoutConfig, LayoutHints};
use crate::preprocess::{binarize, to_canonical};
use crate::protocol::GradeRequest;

/// Upper bound on questions per sheet; anything larger is a malformed request
pub const MAX_QUESTIONS: u32 = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct GraderOptions {
    pub batch_policy: BatchFailurePolicy,
    pub reveal_missed: bool,
}

/// Grading of one in-memory sheet
#[derive(Debug, Clone)]
pub struct GradedSheet {
    pub layout: LayoutConfig,
    pub answers: BTreeMap<u32, QuestionResult>,
    pub correct_count: u32,
    /// Canonical-resolution copy with feedback markers
    pub annotated: RgbImage,
}

/// Outcome of a request, ready to be reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradingResult {
    pub annotated_image: PathBuf,
    pub answers: BTreeMap<u32, QuestionResult>,
    pub correct_count: u32,
    pub total_questions: u32,
}

/// Grading session: owns the optional model capabilities across requests
///
/// Everything derived from a single sheet (detected column bounds, layout
/// overrides, request-supplied detections) lives only for the duration of
/// one call. The label map persists until a request names a different file.
pub struct Grader {
    classifier: Option<Box<dyn Classifier>>,
    detector: Option<Box<dyn ColumnDetector>>,
    labels: LabelMap,
    /// File the current label map came from, `None` for the built-in table
    labels_path: Option<PathBuf>,
    options: GraderOptions,
}

impl Grader {
    pub fn new(options: GraderOptions) -> Self {
        Self {
            classifier: None,
            detector: None,
            labels: LabelMap::default(),
            labels_path: None,
            options,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn ColumnDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Switch to the label map stored at `path`
    ///
    /// Nothing is reloaded when `path` is the file already in use. A file
    /// that cannot be loaded is logged and replaced by the built-in table.
    pub fn load_labels(&mut self, path: &Path) {
        if self.labels_path.as_deref() == Some(path) {
            return;
        }

        match LabelMap::load(path) {
            Ok(map) => {
                tracing::info!("Loaded label map with {} entries from {:?}", map.len(), path);
                self.labels = map;
                self.labels_path = Some(path.to_path_buf());
            }
            Err(err) => {
                tracing::warn!("{:#}; using default label map", err);
                self.labels = LabelMap::default();
                self.labels_path = None;
            }
        }
    }

    /// Grade a decoded sheet without touching the filesystem
    pub fn grade_image(
        &mut self,
        image: &DynamicImage,
        hints: &LayoutHints,
        key: Option<&AnswerKey>,
    ) -> GradeResult<GradedSheet> {
        self.grade_sheet(image, hints, key, None)
    }

    /// Pipeline shared by every entry point; `request_detector` replaces the
    /// session detector for this call only
    fn grade_sheet(
        &mut self,
        image: &DynamicImage,
        hints: &LayoutHints,
        key: Option<&AnswerKey>,
        request_detector: Option<&mut (dyn ColumnDetector + '_)>,
    ) -> GradeResult<GradedSheet> {
        let layout = resolve_layout(hints, key);
        if layout.total_questions > MAX_QUESTIONS {
            return Err(GradeError::InvalidRequest(format!(
                "total_questions {} exceeds the maximum of {}",
                layout.total_questions, MAX_QUESTIONS
            )));
        }
        layout.check_extent().map_err(GradeError::InvalidRequest)?;

        let canonical = to_canonical(image);
        let (layout, bounds) = match request_detector {
            Some(detector) => refine_with_detector(&canonical, &layout, Some(detector)),
            None => refine_with_detector(&canonical, &layout, self.detector.as_deref_mut()),
        };
        tracing::debug!("Resolved layout: {:?}", layout);

        let binary = binarize(&canonical);
        let answers = classify_questions(
            &binary,
            &layout,
            &bounds,
            self.classifier.as_deref_mut(),
            &self.labels,
            self.options.batch_policy,
        );

        let mut annotated = canonical;
        let correct_count = score_and_annotate(
            &answers,
            &layout,
            key,
            &mut annotated,
            self.options.reveal_missed,
        );

        Ok(GradedSheet {
            layout,
            answers,
            correct_count,
            annotated,
        })
    }

    /// Grade the sheet named by a request and save the annotated copy next to it
    pub fn grade(&mut self, request: &GradeRequest) -> GradeResult<GradingResult> {
        let path = &request.image_path;
        if !path.is_file() {
            return Err(GradeError::ImageNotFound(path.clone()));
        }

        let image = ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(ImageError::IoError)
            .and_then(|reader| reader.decode())
            .map_err(|source| GradeError::Decode {
                path: path.clone(),
                source,
            })?;

        if let Some(labels) = &request.labels {
            self.load_labels(labels);
        }

        let mut detections = request.detections.as_deref().and_then(|path| {
            PrecomputedDetector::load(path)
                .map_err(|err| tracing::warn!("{:#}; grading without detections", err))
                .ok()
        });

        let sheet = self.grade_sheet(
            &image,
            &request.layout,
            request.answer_key.as_ref(),
            detections.as_mut().map(|d| d as &mut dyn ColumnDetector),
        )?;

        let output_path = annotated_path(path);
        sheet
            .annotated
            .save(&output_path)
            .map_err(|source| GradeError::SaveAnnotated {
                path: output_path.clone(),
                source,
            })?;

        tracing::info!(
            "Graded {:?}: {}/{} correct -> {:?}",
            path,
            sheet.correct_count,
            sheet.layout.total_questions,
            output_path
        );

        Ok(GradingResult {
            annotated_image: output_path,
            answers: sheet.answers,
            correct_count: sheet.correct_count,
            total_questions: sheet.layout.total_questions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::DetectionBox;
    use crate::labels::Answer;
    use crate::layout::Origin;
    use crate::region::bubble_center;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;
    use nalgebra::{DMatrix, DVector};

    fn scenario_hints() -> LayoutHints {
        LayoutHints {
            questions_per_column: Some(15),
            bubble_h_spacing: Some(30.0),
            bubble_v_spacing: Some(26.0),
            column1_origin: Some(Origin::new(100.0, 100.0)),
            column2_origin: Some(Origin::new(400.0, 100.0)),
            ..Default::default()
        }
    }

    /// White 600x800 sheet with one filled bubble at question 3, option B
    fn scenario_sheet() -> RgbImage {
        let mut sheet = RgbImage::from_pixel(600, 800, Rgb([255, 255, 255]));
        let layout = resolve_layout(&scenario_hints(), None);
        let center = bubble_center(&layout, 3, Answer::B).unwrap();
        draw_filled_circle_mut(&mut sheet, center, 8, Rgb([0, 0, 0]));
        sheet
    }

    struct BrokenClassifier;

    impl Classifier for BrokenClassifier {
        fn predict(&mut self, _batch: &[DMatrix<f32>]) -> anyhow::Result<Vec<DVector<f32>>> {
            anyhow::bail!("no session")
        }
    }

    #[test]
    fn test_end_to_end_in_memory() {
        let key: AnswerKey = [(3, Answer::B)].into_iter().collect();
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let mut grader = Grader::new(GraderOptions::default());

        let sheet = grader.grade_image(&image, &scenario_hints(), Some(&key)).unwrap();
        assert_eq!(sheet.layout.total_questions, 3);
        assert_eq!(sheet.answers[&3], QuestionResult::Marked(Answer::B));
        assert_eq!(sheet.answers[&1], QuestionResult::Empty);
        assert_eq!(sheet.correct_count, 1);
        assert_eq!(sheet.annotated.dimensions(), (600, 800));
    }

    #[test]
    fn test_broken_classifier_degrades_to_pixels() {
        let key: AnswerKey = [(3, Answer::B)].into_iter().collect();
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let mut grader =
            Grader::new(GraderOptions::default()).with_classifier(Box::new(BrokenClassifier));

        let sheet = grader.grade_image(&image, &scenario_hints(), Some(&key)).unwrap();
        assert_eq!(sheet.answers[&3], QuestionResult::Marked(Answer::B));
        assert_eq!(sheet.correct_count, 1);
    }

    #[test]
    fn test_detector_state_does_not_leak() {
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let hints = LayoutHints {
            total_questions: Some(30),
            ..Default::default()
        };
        let detection = DetectionBox {
            x1: 80.0,
            y1: 79.0,
            x2: 260.0,
            y2: 469.0,
            class_id: 0,
            confidence: 0.9,
        };
        let mut grader = Grader::new(GraderOptions::default());
        let mut detector = PrecomputedDetector::new(vec![detection]);

        let first = grader.grade_sheet(&image, &hints, None, Some(&mut detector)).unwrap();
        assert_eq!(first.layout.origin(0), Some(Origin::new(100.0, 100.0)));

        let second = grader.grade_image(&image, &hints, None).unwrap();
        assert_eq!(second.layout.origin(0), None);
        assert!(second.answers.values().all(|r| *r == QuestionResult::Empty));
    }

    #[test]
    fn test_rejects_huge_sheet() {
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let hints = LayoutHints {
            total_questions: Some(MAX_QUESTIONS + 1),
            ..Default::default()
        };
        let err = Grader::new(GraderOptions::default())
            .grade_image(&image, &hints, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn test_session_detector() {
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let detection = DetectionBox {
            x1: 380.0,
            y1: 80.0,
            x2: 560.0,
            y2: 470.0,
            class_id: 0,
            confidence: 0.9,
        };
        let mut grader = Grader::new(GraderOptions::default())
            .with_detector(Box::new(PrecomputedDetector::new(vec![detection])));

        for _ in 0..2 {
            let sheet = grader.grade_image(&image, &LayoutHints::default(), None).unwrap();
            assert_eq!(sheet.layout.origin(0), Some(Origin::new(400.0, 101.0)));
        }
    }

    #[test]
    fn test_rejects_out_of_frame_geometry() {
        let image = DynamicImage::ImageRgb8(scenario_sheet());
        let mut grader = Grader::new(GraderOptions::default());

        let hints = LayoutHints {
            bubble_radius: Some(1e30),
            ..scenario_hints()
        };
        let err = grader.grade_image(&image, &hints, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
        assert!(err.to_string().contains("bubble_radius"));

        let hints = LayoutHints {
            column2_origin: Some(Origin::new(1e12, 100.0)),
            ..scenario_hints()
        };
        let err = grader.grade_image(&image, &hints, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);

        // The session is still usable afterwards
        let sheet = grader.grade_image(&image, &scenario_hints(), None).unwrap();
        assert_eq!(sheet.answers[&3], QuestionResult::Marked(Answer::B));
    }

    #[test]
    fn test_end_to_end_files() {
        let dir = std::env::temp_dir().join(format!("omr-grade-e2e-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("sheet.png");
        scenario_sheet().save(&input).unwrap();

        let request = GradeRequest {
            layout: scenario_hints(),
            answer_key: Some([(3, Answer::B)].into_iter().collect()),
            ..GradeRequest::new(input.clone())
        };
        let result = Grader::new(GraderOptions::default()).grade(&request).unwrap();
        assert_eq!(result.correct_count, 1);
        assert_eq!(result.total_questions, 3);
        assert_eq!(result.answers[&3], QuestionResult::Marked(Answer::B));
        assert_eq!(result.annotated_image, dir.join("checked_sheet.png"));
        assert!(result.annotated_image.is_file());

        let missing = GradeRequest::new(dir.join("missing.png"));
        let err = Grader::new(GraderOptions::default()).grade(&missing).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);

        let garbage = dir.join("garbage.png");
        std::fs::write(&garbage, b"not an image").unwrap();
        let request = GradeRequest::new(garbage);
        let err = Grader::new(GraderOptions::default()).grade(&request).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DecodeError);

        std::fs::remove_dir_all(&dir).ok();
    }
}
