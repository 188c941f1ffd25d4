//! External worker process execution and output classification

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::LineKind;

/// Grace period for pipe readers after the worker has exited or been killed
const READER_GRACE: Duration = Duration::from_secs(2);

/// How to launch one kind of worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable (default: python3)
    pub program: String,
    /// Leading arguments, typically the script path
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Hard per-attempt timeout in seconds (default: 15 minutes)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Substrings that mark a stderr line as an error
    #[serde(default = "default_error_markers")]
    pub error_markers: Vec<String>,
    /// Whether a successful run must print a JSON payload on stdout
    #[serde(default)]
    pub expect_payload: bool,
}

fn default_timeout_secs() -> u64 {
    15 * 60
}

fn default_error_markers() -> Vec<String> {
    vec!["- ERROR -".to_string(), "- CRITICAL -".to_string()]
}

impl WorkerConfig {
    /// A python3 script worker
    pub fn script(path: impl Into<String>, expect_payload: bool) -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![path.into()],
            working_dir: None,
            timeout_secs: default_timeout_secs(),
            error_markers: default_error_markers(),
            expect_payload,
        }
    }

    /// Build the command for one document: `(input_file_path, institution_name, year)`
    pub fn command(&self, input: &Path, institution: &str, year: i32) -> WorkerCommand {
        let mut args = self.args.clone();
        args.push(input.display().to_string());
        args.push(institution.to_string());
        args.push(year.to_string());

        WorkerCommand {
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            error_markers: self.error_markers.clone(),
        }
    }
}

/// A fully resolved worker invocation
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub error_markers: Vec<String>,
}

impl WorkerCommand {
    /// Classify one stderr line
    pub fn classify_stderr(&self, line: &str) -> LineKind {
        if self.error_markers.iter().any(|m| line.contains(m.as_str())) {
            LineKind::StderrError
        } else {
            LineKind::StderrInfo
        }
    }
}

/// One classified line of worker output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLine {
    pub kind: LineKind,
    pub text: String,
}

/// What happened when a worker ran to completion (or was killed)
#[derive(Debug, Clone, Default)]
pub struct WorkerOutcome {
    /// Exit code, None when killed by a signal or the timeout
    pub exit_code: Option<i32>,
    /// stderr lines carrying an error marker
    pub error_lines: Vec<String>,
    /// All stdout lines, in order
    pub stdout: Vec<String>,
    pub timed_out: bool,
}

impl WorkerOutcome {
    /// Exit 0, no flagged stderr line, not timed out
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0) && self.error_lines.is_empty()
    }

    /// Turn a failed run into a `WorkerExecution` error
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded() {
            return Ok(self);
        }
        let reason = if self.timed_out {
            "worker timed out and was killed".to_string()
        } else {
            match (self.exit_code, self.error_lines.last()) {
                (Some(0), Some(line)) => format!("worker reported an error: {}", line.trim()),
                (Some(code), Some(line)) => {
                    format!("worker exited with code {}: {}", code, line.trim())
                }
                (Some(code), None) => format!("worker exited with code {}", code),
                (None, _) => "worker terminated by signal".to_string(),
            }
        };
        Err(Error::worker(reason))
    }
}

/// JSON result printed by payload-producing workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub success: bool,
    #[serde(default)]
    pub extracted_data: Option<Value>,
    #[serde(default)]
    pub normalized_data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerPayload {
    /// Parse the payload from collected stdout.
    ///
    /// The whole output is tried first; failing that, the last line that
    /// looks like a JSON object.
    pub fn parse(stdout: &[String]) -> Result<Self> {
        let joined = stdout.join("\n");
        let payload: Self = match serde_json::from_str(joined.trim()) {
            Ok(p) => p,
            Err(whole_err) => {
                let candidate = stdout
                    .iter()
                    .rev()
                    .map(|l| l.trim())
                    .find(|l| l.starts_with('{'))
                    .ok_or_else(|| Error::Parse(whole_err.to_string()))?;
                serde_json::from_str(candidate).map_err(|e| Error::Parse(e.to_string()))?
            }
        };

        if !payload.success {
            return Err(Error::worker(
                payload
                    .error
                    .unwrap_or_else(|| "worker reported success=false".to_string()),
            ));
        }
        Ok(payload)
    }
}

/// Runs one worker invocation, pushing classified lines as they arrive
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, command: &WorkerCommand, lines: mpsc::Sender<WorkerLine>) -> Result<WorkerOutcome>;
}

/// `WorkerRunner` backed by a real child process
#[derive(Debug, Clone, Default)]
pub struct WorkerProcessRunner;

impl WorkerProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerRunner for WorkerProcessRunner {
    async fn run(&self, command: &WorkerCommand, lines: mpsc::Sender<WorkerLine>) -> Result<WorkerOutcome> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::WorkerSpawn(format!("{}: {}", command.program, e)))?;

        tracing::debug!(
            "Worker started: {} {:?} (pid {:?})",
            command.program,
            command.args,
            child.id()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("worker stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("worker stderr was not captured"))?;

        let stdout_lines = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = {
            let tx = lines.clone();
            let collected = Arc::clone(&stdout_lines);
            tokio::spawn(async move {
                forward_lines(stdout, |text| {
                    collected.lock().push(text.clone());
                    WorkerLine {
                        kind: LineKind::StdoutInfo,
                        text,
                    }
                }, &tx)
                .await;
            })
        };

        let error_lines = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = {
            let tx = lines;
            let classifier = command.clone();
            let flagged = Arc::clone(&error_lines);
            tokio::spawn(async move {
                forward_lines(stderr, |text| {
                    let kind = classifier.classify_stderr(&text);
                    if kind.is_error() {
                        tracing::error!("Worker error line: {}", text);
                        flagged.lock().push(text.clone());
                    }
                    WorkerLine { kind, text }
                }, &tx)
                .await;
            })
        };

        let (exit_code, timed_out) = match tokio::time::timeout(command.timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                tracing::warn!(
                    "Worker exceeded {:?}, killing pid {:?}",
                    command.timeout,
                    child.id()
                );
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill worker: {}", e);
                }
                (None, true)
            }
        };

        let stdout = join_reader(stdout_task, &stdout_lines).await;
        let error_lines = join_reader(stderr_task, &error_lines).await;

        Ok(WorkerOutcome {
            exit_code,
            error_lines,
            stdout,
            timed_out,
        })
    }
}

/// Read `reader` line by line until EOF, forwarding each line.
///
/// Keeps draining after the receiver is gone so the child never blocks on a
/// full pipe.
async fn forward_lines<R, F>(reader: R, mut to_line: F, tx: &mpsc::Sender<WorkerLine>)
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> WorkerLine,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut receiver_alive = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                let line = to_line(text);
                if receiver_alive && tx.send(line).await.is_err() {
                    receiver_alive = false;
                }
            }
            Err(e) => {
                tracing::warn!("Worker pipe read failed: {}", e);
                break;
            }
        }
    }
}

/// Wait briefly for a pipe reader, then take whatever it collected
async fn join_reader(
    handle: tokio::task::JoinHandle<()>,
    collected: &Mutex<Vec<String>>,
) -> Vec<String> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Worker pipe reader failed: {}", e),
        Err(_) => {
            // A grandchild still holds the pipe open
            tracing::warn!("Worker pipe still open after exit, keeping lines read so far");
            abort.abort();
        }
    }
    std::mem::take(&mut *collected.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        default_error_markers()
    }

    #[cfg(unix)]
    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
            timeout: Duration::from_secs(10),
            error_markers: markers(),
        }
    }

    #[cfg(unix)]
    async fn run_collect(command: WorkerCommand) -> (Result<WorkerOutcome>, Vec<WorkerLine>) {
        let (tx, mut rx) = mpsc::channel(64);
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(line) = rx.recv().await {
                seen.push(line);
            }
            seen
        });
        let outcome = WorkerProcessRunner::new().run(&command, tx).await;
        (outcome, collector.await.unwrap())
    }

    #[test]
    fn test_command_appends_positional_args() {
        let config = WorkerConfig::script("scripts/process_pdf.py", true);
        let cmd = config.command(Path::new("/tmp/a.pdf"), "Escola X", 2024);
        assert_eq!(cmd.program, "python3");
        assert_eq!(
            cmd.args,
            vec!["scripts/process_pdf.py", "/tmp/a.pdf", "Escola X", "2024"]
        );
        assert_eq!(cmd.timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_stderr_classification() {
        let cmd = WorkerConfig::script("x.py", false).command(Path::new("f"), "i", 2024);
        assert_eq!(
            cmd.classify_stderr("2024-01-01 10:00:00 - pipeline - INFO - page 1"),
            LineKind::StderrInfo
        );
        assert_eq!(
            cmd.classify_stderr("2024-01-01 10:00:00 - pipeline - WARNING - slow"),
            LineKind::StderrInfo
        );
        assert_eq!(
            cmd.classify_stderr("2024-01-01 10:00:00 - pipeline - ERROR - boom"),
            LineKind::StderrError
        );
        assert_eq!(
            cmd.classify_stderr("x - CRITICAL - disk full"),
            LineKind::StderrError
        );
    }

    #[test]
    fn test_outcome_failure_reasons() {
        let ok = WorkerOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());

        let flagged = WorkerOutcome {
            exit_code: Some(0),
            error_lines: vec!["- ERROR - bad page".into()],
            ..Default::default()
        };
        assert!(!flagged.succeeded());
        assert!(matches!(flagged.into_result(), Err(Error::WorkerExecution(_))));

        let timed_out = WorkerOutcome {
            timed_out: true,
            ..Default::default()
        };
        let err = timed_out.into_result().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_payload_parse() {
        let stdout = vec![
            "loading model".to_string(),
            r#"{"success": true, "extractedData": {"pages": 3}, "normalizedData": {"escola": "x"}}"#.to_string(),
        ];
        let payload = WorkerPayload::parse(&stdout).unwrap();
        assert_eq!(payload.extracted_data.unwrap()["pages"], 3);

        let pretty: Vec<String> = "{\n  \"success\": true,\n  \"normalizedData\": null\n}"
            .lines()
            .map(String::from)
            .collect();
        assert!(WorkerPayload::parse(&pretty).is_ok());

        assert!(matches!(
            WorkerPayload::parse(&["not json".to_string()]),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            WorkerPayload::parse(&[r#"{"success": false, "error": "ocr"}"#.to_string()]),
            Err(Error::WorkerExecution(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lines_are_classified_in_order() {
        let (outcome, lines) = run_collect(sh(
            "echo one; echo two; echo 'x - INFO - note' >&2; exit 0",
        ))
        .await;
        let outcome = outcome.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, vec!["one", "two"]);

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.kind == LineKind::StdoutInfo)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(lines
            .iter()
            .any(|l| l.kind == LineKind::StderrInfo && l.text == "x - INFO - note"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_zero_with_error_line_fails() {
        let (outcome, lines) = run_collect(sh("echo 'a - ERROR - broken' >&2; exit 0")).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.succeeded());
        assert!(lines.iter().any(|l| l.kind == LineKind::StderrError));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let (outcome, _) = run_collect(sh("exit 3")).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.into_result().unwrap_err().to_string().contains("code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_error_line_kept_when_grandchild_holds_stderr() {
        let (outcome, _) = run_collect(sh(
            "echo 'a - ERROR - page 3 unreadable' >&2; (sleep 5 >/dev/null) & exit 0",
        ))
        .await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.error_lines, vec!["a - ERROR - page 3 unreadable"]);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let command = WorkerCommand {
            program: "definitely-not-a-real-worker-binary".into(),
            args: vec![],
            working_dir: None,
            timeout: Duration::from_secs(5),
            error_markers: markers(),
        };
        let (tx, _rx) = mpsc::channel(1);
        let err = WorkerProcessRunner::new().run(&command, tx).await.unwrap_err();
        assert!(matches!(err, Error::WorkerSpawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let mut command = sh("exec sleep 30");
        command.timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let (outcome, _) = run_collect(command).await;
        let outcome = outcome.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_receiver_does_not_stall_worker() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = WorkerProcessRunner::new()
            .run(&sh("for i in 1 2 3 4 5 6 7 8; do echo line$i; done"), tx)
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.len(), 8);
    }
}
