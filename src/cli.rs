use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;

use crate::classify::BatchFailurePolicy;
use crate::grader::GraderOptions;

#[derive(Parser, Debug)]
#[command(name = "omr-grade")]
#[command(version, about = "Grade scanned bubble-sheet answer forms")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log debug details to stderr
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Grade a single sheet and print the result as JSON
    Grade(GradeArgs),
    /// Read JSON requests from stdin, one per line, and answer each on stdout
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct GradeArgs {
    /// Scanned sheet image
    #[arg(required = true)]
    pub image: PathBuf,

    /// JSON file with layout fields (any subset)
    #[arg(short, long)]
    pub layout: Option<PathBuf>,

    /// JSON file mapping question numbers to letters
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// JSON file with question-column boxes detected on the canonical image
    #[arg(short, long)]
    pub detections: Option<PathBuf>,

    #[command(flatten)]
    pub grader: GraderArgs,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub grader: GraderArgs,
}

#[derive(Args, Debug)]
pub struct GraderArgs {
    /// JSON label map for classifier outputs [default: A-E plus NONE]
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// Recovery strategy when a classifier batch fails
    #[arg(long, value_enum, default_value_t = BatchFailurePolicy::DiscardBatch)]
    pub batch_policy: BatchFailurePolicy,

    /// Also show the expected answer on rows with no readable mark
    #[arg(long)]
    pub reveal_missed: bool,
}

impl GraderArgs {
    pub fn options(&self) -> GraderOptions {
        GraderOptions {
            batch_policy: self.batch_policy,
            reveal_missed: self.reveal_missed,
        }
    }
}

impl Cli {
    /// Filter directive used when `RUST_LOG` is not set
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "omr_grade=debug"
        } else {
            "omr_grade=info"
        }
    }
}

/// Read an optional JSON input file
pub fn read_json<T: DeserializeOwned>(path: Option<&Path>) -> Result<Option<T>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse JSON in {:?}", path))?;
    Ok(Some(value))
}
