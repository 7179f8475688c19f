//! CLI entry point for canvas-dl.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use canvas_dl::{
    ApiClient, CliPdfMerger, CourseReport, CourseRequest, CourseSummary, DownloadStats, FilterSpec,
    MergeOptions, PdfMerger, RateBudget, RetryPolicy, download_course, list_courses,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::Settings;
use cli::{Cli, Command, CoursesArgs, DownloadArgs};

/// Process exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    /// Everything selected is on disk.
    Success,
    /// Some files failed or the run was interrupted.
    Partial,
    /// Nothing could be downloaded, or the run could not start.
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Partial => ExitCode::from(1),
            ProcessExit::Failure => ExitCode::from(2),
        }
    }
}

/// Maps report counts to the process exit outcome.
fn determine_exit_outcome(report: &CourseReport) -> ProcessExit {
    let present = report.succeeded.len() + report.skipped.len();
    if report.failed.is_empty() && !report.cancelled {
        ProcessExit::Success
    } else if present > 0 || report.failed.is_empty() {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn init_tracing(default_level: &str) {
    // Priority: RUST_LOG env var > -q > -v count > config verbosity > info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(exit) => exit.into(),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    let loaded = app_config::load_default_file_config()?;
    let settings = Settings::resolve(&cli, process_env, loaded.config.as_ref())?;

    init_tracing(settings.log_level);
    debug!(command = ?cli.command, config = ?loaded.path, "CLI arguments parsed");

    match &cli.command {
        Command::Config => {
            print!("{}", settings.render(process_env, loaded.path.as_deref()));
            Ok(ProcessExit::Success)
        }
        Command::Courses(args) => run_courses(&settings, args).await,
        Command::Download(args) => run_download(&settings, args, cli.quiet).await,
    }
}

fn build_client(settings: &Settings) -> Result<ApiClient> {
    let token = settings.token(process_env)?;
    ApiClient::with_options(
        &settings.api_url,
        token,
        Arc::new(RateBudget::new()),
        settings.connect_timeout_secs,
        settings.read_timeout_secs,
    )
    .with_context(|| format!("Failed to create API client for '{}'", settings.api_url))
}

async fn run_courses(settings: &Settings, args: &CoursesArgs) -> Result<ProcessExit> {
    let client = build_client(settings)?;
    let policy = RetryPolicy::with_max_attempts(settings.max_retries);
    let mut courses = list_courses(&client, &policy)
        .await
        .context("Failed to list courses")?;
    if args.published {
        courses.retain(CourseSummary::is_published);
    }

    for course in &courses {
        println!(
            "{:>8}  {:<16}  {}",
            course.id,
            course.course_code.as_deref().unwrap_or("-"),
            course.name.as_deref().unwrap_or("(restricted)")
        );
    }
    info!(courses = courses.len(), "listed courses");
    Ok(ProcessExit::Success)
}

fn merge_options(settings: &Settings) -> Option<MergeOptions> {
    if !settings.merge {
        return None;
    }
    let Some(merger) = CliPdfMerger::from_path() else {
        warn!("neither pdfunite nor qpdf found on PATH; PDFs will not be merged");
        return None;
    };
    debug!(tool = merger.name(), path = %merger.binary_path().display(), "PDF merge enabled");
    Some(
        MergeOptions::new(Arc::new(merger))
            .with_scope(settings.merge_scope)
            .with_policy(settings.merge_policy),
    )
}

async fn run_download(settings: &Settings, args: &DownloadArgs, quiet: bool) -> Result<ProcessExit> {
    let filter = FilterSpec::from_options(&args.only, args.name.as_deref(), args.regex.as_deref())
        .context("Invalid file filter")?;
    let client = build_client(settings)?;

    let stats = Arc::new(DownloadStats::new());
    let mut request = CourseRequest::new(args.course_id, settings.output_dir.clone())
        .with_filter(filter)
        .with_concurrency(settings.concurrency)
        .with_retry_policy(RetryPolicy::with_max_attempts(settings.max_retries))
        .with_collision(settings.collision)
        .with_source(args.source.into())
        .with_stats(Arc::clone(&stats));
    if let Some(merge) = merge_options(settings) {
        request = request.with_merge(merge);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight downloads");
            interrupt.cancel();
        }
    });

    info!(
        course_id = args.course_id,
        dest = %settings.output_dir.display(),
        concurrency = settings.concurrency,
        "starting course download"
    );

    let use_spinner =
        progress::should_use_spinner(io::stderr().is_terminal(), quiet, progress::is_dumb_terminal());
    let (spinner, stop) = progress::spawn_progress_ui(
        use_spinner,
        Arc::clone(&stats),
        format!("course {}", args.course_id),
    );

    let result = download_course(&client, request, &cancel).await;

    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = spinner {
        let _ = handle.await;
    }

    let report = result.with_context(|| format!("Course {} could not be downloaded", args.course_id))?;
    print_summary(&report, quiet);
    Ok(determine_exit_outcome(&report))
}

fn print_summary(report: &CourseReport, quiet: bool) {
    for failed in &report.failed {
        eprintln!("failed: {} ({})", failed.path.display(), failed.error);
    }
    for warning in &report.merge_warnings {
        eprintln!("merge warning: {warning}");
    }
    if quiet {
        return;
    }
    for warning in &report.listing_warnings {
        println!("note: {warning}");
    }
    for merged in &report.merged {
        println!("merged: {}", merged.display());
    }
    println!(
        "{}: {} downloaded, {} already present, {} failed, {} merged -> {}",
        report.course_name,
        report.succeeded.len(),
        report.skipped.len(),
        report.failed.len(),
        report.merged.len(),
        report.course_dir.display()
    );
    if report.cancelled {
        println!("interrupted before all files finished");
    }
}
