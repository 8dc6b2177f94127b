use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use omr_grade::cli::{read_json, Command, GradeArgs, ServeArgs};
use omr_grade::{serve, AnswerKey, Cli, GradeRequest, GradeResponse, Grader, LayoutHints};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // stdout carries protocol output, so logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Grade(args) => grade(args),
        Command::Serve(args) => run_worker(args),
    }
}

fn grade(args: GradeArgs) -> Result<ExitCode> {
    let layout: LayoutHints = read_json(args.layout.as_deref())?.unwrap_or_default();
    let answer_key: Option<AnswerKey> = read_json(args.key.as_deref())?;

    let mut grader = Grader::new(args.grader.options());
    let request = GradeRequest {
        layout,
        answer_key,
        labels: args.grader.labels,
        detections: args.detections,
        ..GradeRequest::new(args.image)
    };
    let response = GradeResponse::from(grader.grade(&request));

    let json = serde_json::to_string(&response).context("Failed to encode response")?;
    println!("{}", json);

    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_worker(args: ServeArgs) -> Result<ExitCode> {
    let mut grader = Grader::new(args.grader.options());
    if let Some(path) = &args.grader.labels {
        grader.load_labels(path);
    }

    tracing::info!("Worker started");
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(&mut grader, stdin.lock(), stdout.lock())?;

    Ok(ExitCode::SUCCESS)
}
