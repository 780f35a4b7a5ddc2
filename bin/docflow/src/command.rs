//! Document processor backed by an external program.
//!
//! Protocol:
//! - the document bytes are written to the program's stdin;
//! - `DOCFLOW_FILENAME` and `DOCFLOW_CONTENT_TYPE` are set in its environment;
//! - stderr lines of the form `progress <pct> <message>` become progress updates,
//!   any other stderr line is logged;
//! - on exit status 0, stdout must hold a single JSON document, the result.
//!
//! A non-zero exit fails the task with the last non-progress stderr line.
//! The child is killed when the processing future is dropped, so the task
//! deadline also bounds the external program.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use docflow_core::{DocumentInput, DocumentProcessor, ProcessError, ProgressReporter};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

const FILENAME_ENV: &str = "DOCFLOW_FILENAME";
const CONTENT_TYPE_ENV: &str = "DOCFLOW_CONTENT_TYPE";

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl DocumentProcessor for CommandProcessor {
    async fn process(
        &self,
        input: DocumentInput,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, ProcessError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(FILENAME_ENV, &input.descriptor.filename)
            .env(CONTENT_TYPE_ENV, &input.descriptor.content_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::new(format!("failed to start '{}': {e}", self.program)))?;

        let task_id = progress.task_id();
        debug!(%task_id, program = %self.program, pid = ?child.id(), "processor started");

        let (mut stdin, mut stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => return Err(ProcessError::new("processor stdio was not captured")),
            };

        let bytes = input.bytes;
        let feed = async move {
            let written = stdin.write_all(&bytes).await;
            drop(stdin);
            match written {
                // Programs that ignore their input may exit before reading it.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        let collect = async {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).await.map(|_| out)
        };

        let watch = async {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_error = None;
            while let Some(line) = lines.next_line().await? {
                match parse_progress(&line) {
                    Some((pct, message)) => {
                        progress.report(pct, message);
                    }
                    None if line.trim().is_empty() => {}
                    None => {
                        debug!(%task_id, line = %line, "processor stderr");
                        last_error = Some(line);
                    }
                }
            }
            Ok::<_, io::Error>(last_error)
        };

        let (fed, out, last_error) = tokio::join!(feed, collect, watch);
        fed.map_err(|e| ProcessError::new(format!("failed to write document to processor: {e}")))?;
        let out = out.map_err(|e| ProcessError::new(format!("failed to read processor output: {e}")))?;
        let last_error = last_error.unwrap_or_default();

        let status = child
            .wait()
            .await
            .map_err(|e| ProcessError::new(format!("failed to wait for processor: {e}")))?;
        if !status.success() {
            return Err(ProcessError::new(
                last_error.unwrap_or_else(|| format!("'{}' exited with {status}", self.program)),
            ));
        }

        serde_json::from_slice(&out)
            .map_err(|e| ProcessError::new(format!("processor output is not valid JSON: {e}")))
    }
}

/// Parse `progress <pct> [message]`.
fn parse_progress(line: &str) -> Option<(f32, &str)> {
    let rest = line.trim().strip_prefix("progress ")?;
    let (pct, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let pct = pct.parse().ok()?;
    let message = message.trim();
    Some((pct, if message.is_empty() { "processing" } else { message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(parse_progress("progress 33 ocr done"), Some((33.0, "ocr done")));
        assert_eq!(parse_progress("  progress 12.5  "), Some((12.5, "processing")));
        assert_eq!(parse_progress("progress abc text"), None);
        assert_eq!(parse_progress("warning: progress 50"), None);
        assert_eq!(parse_progress("progress"), None);
    }

    #[cfg(unix)]
    mod unix {
        use std::sync::Arc;
        use std::time::Duration;

        use bytes::Bytes;
        use docflow_core::api::DocumentService;
        use docflow_core::config::PDF_CONTENT_TYPE;
        use docflow_core::{Config, FailureKind, InputDescriptor, TaskStatus};

        use super::CommandProcessor;

        fn shell(script: &str) -> Arc<CommandProcessor> {
            Arc::new(CommandProcessor::new("sh", vec!["-c".to_owned(), script.to_owned()]))
        }

        fn submit(service: &DocumentService, name: &str, body: &'static [u8]) -> String {
            let descriptor = InputDescriptor::new(name, body.len() as u64, PDF_CONTENT_TYPE);
            service
                .submit(Bytes::from_static(body), descriptor)
                .expect("submit should succeed")
                .task_id
                .to_string()
        }

        #[tokio::test]
        async fn stdout_json_becomes_the_result() {
            let script = r#"
                size=$(wc -c | tr -d ' ')
                echo "progress 50 counted bytes" >&2
                printf '{"filename":"%s","type":"%s","bytes":%s}' \
                    "$DOCFLOW_FILENAME" "$DOCFLOW_CONTENT_TYPE" "$size"
            "#;
            let service = DocumentService::start(Config::default(), shell(script)).unwrap();
            let id = submit(&service, "report.pdf", b"%PDF-1.7 body");

            let view = service.wait(&id, Duration::from_secs(10)).await.unwrap();
            assert_eq!(view.status, TaskStatus::Completed, "unexpected view {view:?}");
            let result = view.result.expect("result");
            assert_eq!(result["filename"], "report.pdf");
            assert_eq!(result["type"], PDF_CONTENT_TYPE);
            assert_eq!(result["bytes"], 13);
            service.shutdown().await;
        }

        #[tokio::test]
        async fn progress_lines_update_the_task() {
            let script = r#"
                cat > /dev/null
                echo "progress 40 reading layout" >&2
                sleep 1
                echo '{}'
            "#;
            let service = DocumentService::start(Config::default(), shell(script)).unwrap();
            let id = submit(&service, "slow.pdf", b"%PDF");

            let seen = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let view = service.status(&id).unwrap();
                    if view.progress == 40.0 {
                        break view;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("progress line should be forwarded");
            assert_eq!(seen.status, TaskStatus::Processing);
            assert_eq!(seen.message, "reading layout");

            let view = service.wait(&id, Duration::from_secs(10)).await.unwrap();
            assert_eq!(view.status, TaskStatus::Completed);
            service.shutdown().await;
        }

        #[tokio::test]
        async fn non_zero_exit_fails_with_last_stderr_line() {
            let script = r#"
                echo "progress 10 parsing" >&2
                echo "unsupported layout" >&2
                exit 3
            "#;
            let service = DocumentService::start(Config::default(), shell(script)).unwrap();
            let id = submit(&service, "odd.pdf", b"%PDF");

            let view = service.wait(&id, Duration::from_secs(10)).await.unwrap();
            assert_eq!(view.status, TaskStatus::Failed);
            assert!(view.result.is_none());
            let error = view.error.expect("error");
            assert_eq!(error.kind, FailureKind::Processing);
            assert_eq!(error.message, "unsupported layout");
            assert_eq!(view.progress, 10.0);
            service.shutdown().await;
        }

        #[tokio::test]
        async fn invalid_output_fails_the_task() {
            let service = DocumentService::start(Config::default(), shell("echo not-json")).unwrap();
            let id = submit(&service, "garbled.pdf", b"%PDF");

            let view = service.wait(&id, Duration::from_secs(10)).await.unwrap();
            let error = view.error.expect("error");
            assert!(error.message.contains("not valid JSON"), "got {}", error.message);
        }

        #[tokio::test]
        async fn missing_program_fails_the_task() {
            let processor = Arc::new(CommandProcessor::new("/nonexistent/docflow-processor", vec![]));
            let service = DocumentService::start(Config::default(), processor).unwrap();
            let id = submit(&service, "a.pdf", b"%PDF");

            let view = service.wait(&id, Duration::from_secs(10)).await.unwrap();
            let error = view.error.expect("error");
            assert!(error.message.starts_with("failed to start"), "got {}", error.message);
        }

        #[tokio::test]
        async fn deadline_kills_a_hung_program() {
            let config = Config {
                processing_timeout: Some(Duration::from_millis(300)),
                ..Config::default()
            };
            let service = DocumentService::start(config, shell("sleep 30")).unwrap();
            let id = submit(&service, "hung.pdf", b"%PDF");

            let view = service.wait(&id, Duration::from_secs(5)).await.unwrap();
            assert_eq!(view.status, TaskStatus::Failed);
            assert_eq!(view.error.map(|e| e.kind), Some(FailureKind::Timeout));
            service.shutdown().await;
        }
    }
}
