//! Line-based JSON worker protocol
//!
//! The worker prints `READY` once, then answers every non-blank input line
//! (one JSON request) with exactly one JSON response line.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GradeError, GradeResult};
use crate::grader::{Grader, GradingResult};
use crate::layout::{AnswerKey, LayoutHints};

pub const READY_LINE: &str = "READY";

#[derive(Debug, Clone, Deserialize)]
pub struct GradeRequest {
    pub image_path: PathBuf,
    #[serde(default)]
    pub layout: LayoutHints,
    #[serde(default)]
    pub answer_key: Option<AnswerKey>,
    /// Label map for classifier outputs; kept by the session until another file is named
    #[serde(default)]
    pub labels: Option<PathBuf>,
    /// Question-column boxes for this sheet only
    #[serde(default)]
    pub detections: Option<PathBuf>,
}

impl GradeRequest {
    pub fn new(image_path: PathBuf) -> Self {
        Self {
            image_path,
            layout: LayoutHints::default(),
            answer_key: None,
            labels: None,
            detections: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: Option<GradingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl GradeResponse {
    pub fn success(result: GradingResult) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_kind: None,
            error: None,
            retryable: None,
            trace: None,
        }
    }

    pub fn failure(err: &GradeError) -> Self {
        Self {
            success: false,
            result: None,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
            retryable: Some(err.kind().is_retryable()),
            trace: err.trace(),
        }
    }
}

impl From<GradeResult<GradingResult>> for GradeResponse {
    fn from(outcome: GradeResult<GradingResult>) -> Self {
        match outcome {
            Ok(result) => Self::success(result),
            Err(err) => {
                tracing::warn!("Request failed ({:?}): {}", err.kind(), err);
                Self::failure(&err)
            }
        }
    }
}

/// Answer one protocol line; blank lines get no response
pub fn handle_line(grader: &mut Grader, line: &str) -> Option<GradeResponse> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let outcome = serde_json::from_str::<GradeRequest>(line)
        .map_err(|e| GradeError::InvalidRequest(format!("Malformed JSON request: {}", e)))
        .and_then(|request| grader.grade(&request));

    Some(outcome.into())
}

/// Run the worker loop until the input is exhausted
///
/// Request-level problems, including lines that are not UTF-8, are reported
/// in-band; only I/O failures on the streams themselves end the loop.
pub fn serve<R: BufRead, W: Write>(
    grader: &mut Grader,
    mut input: R,
    mut output: W,
) -> Result<()> {
    writeln!(output, "{}", READY_LINE).context("Failed to write ready line")?;
    output.flush()?;

    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = input
            .read_until(b'\n', &mut buf)
            .context("Failed to read request line")?;
        if read == 0 {
            break;
        }

        let response = match std::str::from_utf8(&buf) {
            Ok(line) => handle_line(grader, line),
            Err(err) => {
                let outcome: GradeResult<GradingResult> = Err(GradeError::InvalidRequest(
                    format!("Request line is not valid UTF-8: {}", err),
                ));
                Some(outcome.into())
            }
        };
        let Some(response) = response else {
            continue;
        };

        serde_json::to_writer(&mut output, &response).context("Failed to write response")?;
        writeln!(output)?;
        output.flush()?;
    }

    tracing::info!("Input closed, worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classifier;
    use crate::grader::GraderOptions;
    use image::{Rgb, RgbImage};
    use nalgebra::{DMatrix, DVector};
    use serde_json::{json, Value};
    use std::io::Cursor;

    fn run_with(grader: &mut Grader, input: &[u8]) -> Vec<String> {
        let mut output = Vec::new();
        serve(grader, Cursor::new(input.to_vec()), &mut output).unwrap();
        String::from_utf8(output).unwrap().lines().map(str::to_string).collect()
    }

    fn run(input: &str) -> Vec<String> {
        run_with(&mut Grader::new(GraderOptions::default()), input.as_bytes())
    }

    /// Always votes for the first classifier output
    struct FirstClass;

    impl Classifier for FirstClass {
        fn predict(&mut self, batch: &[DMatrix<f32>]) -> anyhow::Result<Vec<DVector<f32>>> {
            Ok(batch
                .iter()
                .map(|_| DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]))
                .collect())
        }
    }

    struct Workspace(PathBuf);

    impl Workspace {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("omr-grade-{}-{}", name, std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            RgbImage::from_pixel(600, 800, Rgb([255, 255, 255]))
                .save(dir.join("sheet.png"))
                .unwrap();
            Self(dir)
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.0.join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }

        fn request(&self, extra: Value) -> String {
            let mut request = json!({ "image_path": self.0.join("sheet.png") });
            if let (Some(fields), Some(extra)) = (request.as_object_mut(), extra.as_object()) {
                fields.extend(extra.clone());
            }
            format!("{}\n", request)
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    fn first_answer(line: &str) -> String {
        let response: Value = serde_json::from_str(line).unwrap();
        assert_eq!(response["success"], true, "{}", line);
        response["answers"]["1"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_loop_survives_bad_requests() {
        let lines = run("\nnot json\n   \n{\"image_path\": \"/nonexistent/sheet.png\"}\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], READY_LINE);

        let malformed: Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(malformed["success"], false);
        assert_eq!(malformed["error_kind"], "ValidationError");
        assert!(malformed.get("trace").is_none());
        assert_eq!(malformed["retryable"], false);

        let missing: Value = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(missing["success"], false);
        assert!(missing["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn test_invalid_utf8_line_is_answered() {
        let mut grader = Grader::new(GraderOptions::default());
        let lines = run_with(
            &mut grader,
            b"\xff\xfe garbage\n{\"image_path\": \"/nonexistent/sheet.png\"}\n",
        );
        assert_eq!(lines.len(), 3);

        let garbled: Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(garbled["success"], false);
        assert_eq!(garbled["error_kind"], "ValidationError");
        assert_eq!(garbled["retryable"], false);
        assert!(garbled["error"].as_str().unwrap().contains("UTF-8"));

        let missing: Value = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(missing["error_kind"], "ValidationError");
    }

    #[test]
    fn test_labels_follow_request() {
        let workspace = Workspace::new("labels");
        let custom = workspace.write("labels.json", r#"{"0": "C", "1": "NONE"}"#);
        let broken = workspace.write("broken.json", "not json");
        let layout = json!({ "total_questions": 1, "column1_origin": [100, 100] });

        let input = [
            workspace.request(json!({ "layout": layout })),
            workspace.request(json!({ "layout": layout, "labels": custom })),
            workspace.request(json!({ "layout": layout })),
            workspace.request(json!({ "layout": layout, "labels": broken })),
        ]
        .concat();

        let mut grader = Grader::new(GraderOptions::default()).with_classifier(Box::new(FirstClass));
        let lines = run_with(&mut grader, input.as_bytes());
        let answers: Vec<String> = lines[1..].iter().map(|l| first_answer(l)).collect();
        assert_eq!(answers, ["A", "C", "C", "A"]);
    }

    #[test]
    fn test_detections_are_request_scoped() {
        let workspace = Workspace::new("detections");
        let boxes = workspace.write(
            "boxes.json",
            r#"[{"x1": 80, "y1": 79, "x2": 260, "y2": 469, "class_id": 0, "confidence": 0.9}]"#,
        );
        let layout = json!({ "total_questions": 1 });

        let input = [
            workspace.request(json!({ "layout": layout, "detections": boxes })),
            workspace.request(json!({ "layout": layout })),
            workspace.request(json!({ "layout": layout, "detections": "/nonexistent/boxes.json" })),
        ]
        .concat();

        let mut grader = Grader::new(GraderOptions::default()).with_classifier(Box::new(FirstClass));
        let lines = run_with(&mut grader, input.as_bytes());
        let answers: Vec<String> = lines[1..].iter().map(|l| first_answer(l)).collect();
        // Without detected columns there is no origin, so nothing is classified
        assert_eq!(answers, ["A", "EMPTY", "EMPTY"]);
    }

    #[test]
    fn test_request_defaults() {
        let request: GradeRequest = serde_json::from_str(r#"{"image_path": "a.png"}"#).unwrap();
        assert_eq!(request.layout, LayoutHints::default());
        assert!(request.answer_key.is_none());
        assert!(request.labels.is_none() && request.detections.is_none());

        let request: GradeRequest = serde_json::from_str(
            r#"{"image_path": "a.png", "layout": {"total_questions": 28}, "answer_key": {"1": "A"}}"#,
        )
        .unwrap();
        assert_eq!(request.layout.total_questions, Some(28));
        assert_eq!(request.answer_key.unwrap().len(), 1);
    }

    #[test]
    fn test_success_shape() {
        use crate::classify::QuestionResult;
        use crate::labels::Answer;
        use std::collections::BTreeMap;

        let response = GradeResponse::success(GradingResult {
            annotated_image: PathBuf::from("checked_a.png"),
            answers: BTreeMap::from([(1, QuestionResult::Marked(Answer::C)), (2, QuestionResult::Empty)]),
            correct_count: 1,
            total_questions: 2,
        });
        let json: Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["answers"]["1"], "C");
        assert_eq!(json["answers"]["2"], "EMPTY");
        assert_eq!(json["correct_count"], 1);
        assert_eq!(json["annotated_image"], "checked_a.png");
        assert!(json.get("error").is_none());
    }
}
