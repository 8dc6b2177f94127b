pub mod annotate;
pub mod classify;
pub mod cli;
pub mod columns;
pub mod error;
pub mod grader;
pub mod labels;
pub mod layout;
pub mod preprocess;
pub mod protocol;
pub mod region;

pub use annotate::{annotated_path, score_and_annotate};
pub use classify::{classify_questions, BatchFailurePolicy, Classifier, QuestionResult};
pub use cli::Cli;
pub use columns::{refine_with_detector, ColumnBounds, ColumnDetector, DetectionBox, PrecomputedDetector};
pub use error::{ErrorKind, GradeError, GradeResult};
pub use grader::{GradedSheet, Grader, GraderOptions, GradingResult};
pub use labels::{Answer, Label, LabelMap};
pub use layout::{resolve_layout, AnswerKey, LayoutConfig, LayoutHints, Origin};
pub use preprocess::{binarize, to_canonical, CANONICAL_HEIGHT, CANONICAL_WIDTH};
pub use protocol::{serve, GradeRequest, GradeResponse};
pub use region::{map_region, Region};
