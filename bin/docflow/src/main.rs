//! docflow – process documents through an external program with tracked progress.
//!
//! Startup order:
//! 1. Parse command-line flags and environment settings.
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Start the document service with the command processor.
//! 4. Submit every input file, wait for all tasks concurrently, and print each
//!    final status as one JSON line on stdout.

mod command;
mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use docflow_core::api::{DocumentService, TaskStatusView};
use docflow_core::config::{DOCX_CONTENT_TYPE, PDF_CONTENT_TYPE};
use docflow_core::{InputDescriptor, TaskError, TaskStatus};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::command::CommandProcessor;
use crate::config::Settings;

#[derive(Debug, Parser)]
#[command(name = "docflow", version, about)]
struct Cli {
    /// Program that processes one document (stdin in, JSON on stdout).
    #[arg(long, env = "DOCFLOW_COMMAND")]
    command: String,

    /// Argument passed to the program; repeat for several.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Content type for every input, instead of guessing from the extension.
    #[arg(long)]
    content_type: Option<String>,

    /// Overrides DOCFLOW_WORKERS.
    #[arg(long)]
    workers: Option<usize>,

    /// Overrides DOCFLOW_PROCESSING_TIMEOUT_SECS; 0 disables the deadline.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Give up waiting for a task after this many seconds.
    #[arg(long, default_value_t = 3600)]
    wait_secs: u64,

    /// Documents to process.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let settings = Settings::from_env();

    let mut cfg = docflow_core::Config::from_env();
    if let Some(workers) = cli.workers {
        cfg.workers = workers;
    }
    if let Some(secs) = cli.timeout_secs {
        cfg.processing_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Logs go to stderr so stdout carries only status records.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|e| {
            eprintln!(
                "WARN: DOCFLOW_LOG='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                settings.log_level
            );
            EnvFilter::new("info")
        });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if settings.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "docflow starting");

    // ── 3. Document service ────────────────────────────────────────────────────
    let processor = Arc::new(CommandProcessor::new(cli.command.clone(), cli.args.clone()));
    let service = DocumentService::start(cfg, processor).context("invalid configuration")?;

    // ── 4. Submit, wait, report ────────────────────────────────────────────────
    let mut submitted = Vec::with_capacity(cli.files.len());
    let mut failures = 0usize;
    for path in &cli.files {
        match submit_file(&service, path, cli.content_type.as_deref()).await {
            Ok(task_id) => submitted.push((path.clone(), task_id)),
            Err(e) => {
                failures += 1;
                warn!(path = %path.display(), error = %e, "document not submitted");
                println!(
                    "{}",
                    serde_json::json!({ "path": path.display().to_string(), "error": format!("{e:#}") })
                );
            }
        }
    }

    let wait_for = Duration::from_secs(cli.wait_secs);
    let outcomes = tokio::select! {
        outcomes = wait_all(&service, &submitted, wait_for) => Some(outcomes),
        _ = interrupted() => None,
    };

    if let Some(outcomes) = &outcomes {
        for outcome in outcomes {
            if !outcome.completed() {
                failures += 1;
                warn!(path = %outcome.path.display(), task_id = %outcome.task_id, "document did not complete");
            }
            println!("{}", outcome.to_line()?);
        }
    }

    service.shutdown().await;
    info!("docflow stopped");

    if outcomes.is_none() {
        anyhow::bail!("interrupted before all documents finished");
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} documents did not complete", cli.files.len());
    }
    Ok(())
}

async fn submit_file(
    service: &DocumentService,
    path: &Path,
    content_type: Option<&str>,
) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let content_type = content_type.unwrap_or_else(|| guess_content_type(path));

    let descriptor = InputDescriptor::new(filename, bytes.len() as u64, content_type);
    let receipt = service.submit(bytes, descriptor)?;
    Ok(receipt.task_id.to_string())
}

/// Final status of one submitted document.
#[derive(Debug)]
struct Outcome<'a> {
    path: &'a Path,
    task_id: &'a str,
    /// `NotFound` if the task was deleted or reaped before it was observed.
    status: Result<TaskStatusView, TaskError>,
}

impl Outcome<'_> {
    fn completed(&self) -> bool {
        matches!(&self.status, Ok(view) if view.status == TaskStatus::Completed)
    }

    fn to_line(&self) -> serde_json::Result<String> {
        match &self.status {
            Ok(view) => serde_json::to_string(view),
            Err(e) => serde_json::to_string(&serde_json::json!({
                "path": self.path.display().to_string(),
                "task_id": self.task_id,
                "error": e.to_string(),
            })),
        }
    }
}

/// Wait for all tasks at once, so an early finisher is observed before its
/// retention window runs out.
async fn wait_all<'a>(
    service: &DocumentService,
    submitted: &'a [(PathBuf, String)],
    wait_for: Duration,
) -> Vec<Outcome<'a>> {
    join_all(submitted.iter().map(|(path, task_id)| async move {
        Outcome {
            path,
            task_id,
            status: service.wait(task_id, wait_for).await,
        }
    }))
    .await
}

fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => PDF_CONTENT_TYPE,
        "docx" => DOCX_CONTENT_TYPE,
        _ => "application/octet-stream",
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    info!("interrupted; stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(guess_content_type(Path::new("a/Report.PDF")), PDF_CONTENT_TYPE);
        assert_eq!(guess_content_type(Path::new("notes.docx")), DOCX_CONTENT_TYPE);
        assert_eq!(guess_content_type(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn cli_collects_repeated_args() {
        let cli = Cli::try_parse_from([
            "docflow", "--command", "extract", "--arg", "--fast", "--arg", "-v", "a.pdf", "b.docx",
        ])
        .unwrap();
        assert_eq!(cli.command, "extract");
        assert_eq!(cli.args, ["--fast", "-v"]);
        assert_eq!(cli.files.len(), 2);
        assert_eq!(cli.wait_secs, 3600);
    }

    /// Completes immediately unless the filename starts with `slow`.
    struct NapProcessor;

    #[async_trait::async_trait]
    impl docflow_core::DocumentProcessor for NapProcessor {
        async fn process(
            &self,
            input: docflow_core::DocumentInput,
            _progress: docflow_core::ProgressReporter,
        ) -> Result<serde_json::Value, docflow_core::ProcessError> {
            if input.descriptor.filename.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(serde_json::json!({ "filename": input.descriptor.filename }))
        }
    }

    fn submit(service: &DocumentService, name: &str) -> (PathBuf, String) {
        let bytes = bytes::Bytes::from_static(b"%PDF-1.7");
        let descriptor = InputDescriptor::new(name, bytes.len() as u64, PDF_CONTENT_TYPE);
        let receipt = service.submit(bytes, descriptor).unwrap();
        (PathBuf::from(name), receipt.task_id.to_string())
    }

    #[tokio::test]
    async fn early_finishers_are_not_lost_to_the_reaper() {
        let config = docflow_core::Config {
            retention: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(20),
            ..docflow_core::Config::default()
        };
        let service = DocumentService::start(config, Arc::new(NapProcessor)).unwrap();
        let submitted = vec![submit(&service, "slow.pdf"), submit(&service, "fast.pdf")];

        let outcomes = wait_all(&service, &submitted, Duration::from_secs(5)).await;
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert!(outcome.completed(), "{outcome:?}");
        }
        let fast = outcomes[1].to_line().unwrap();
        assert!(fast.contains("\"filename\":\"fast.pdf\""), "{fast}");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn vanished_task_is_reported_per_document() {
        let service = DocumentService::start(docflow_core::Config::default(), Arc::new(NapProcessor)).unwrap();
        let submitted = vec![submit(&service, "gone.pdf"), submit(&service, "kept.pdf")];
        service.delete(&submitted[0].1).unwrap();

        let outcomes = wait_all(&service, &submitted, Duration::from_secs(5)).await;
        assert!(matches!(outcomes[0].status, Err(TaskError::NotFound { .. })));
        assert!(!outcomes[0].completed());
        let line: serde_json::Value = serde_json::from_str(&outcomes[0].to_line().unwrap()).unwrap();
        assert_eq!(line["path"], "gone.pdf");
        assert_eq!(line["task_id"], submitted[0].1.as_str());
        assert!(outcomes[1].completed());
        service.shutdown().await;
    }
}
