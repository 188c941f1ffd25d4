//! Shared fixtures for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::processing::{WorkerCommand, WorkerLine, WorkerOutcome, WorkerRunner};
use crate::types::{AccessLevel, Identity, LineKind, Role, UploadRequest};

pub const PDF: &[u8] = b"%PDF-1.7\n%fake body";

/// One scripted worker attempt
pub enum Step {
    Run { lines: Vec<WorkerLine>, exit: i32 },
    SpawnError,
}

impl Step {
    pub fn ok(lines: Vec<WorkerLine>) -> Self {
        Step::Run { lines, exit: 0 }
    }
}

pub fn out(text: &str) -> WorkerLine {
    WorkerLine {
        kind: LineKind::StdoutInfo,
        text: text.into(),
    }
}

pub fn err_line(text: &str) -> WorkerLine {
    WorkerLine {
        kind: LineKind::StderrError,
        text: text.into(),
    }
}

/// Replays scripted attempts instead of spawning processes; once the
/// script runs out every attempt exits 0 with no output
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerRunner for ScriptedRunner {
    async fn run(&self, _command: &WorkerCommand, lines: mpsc::Sender<WorkerLine>) -> Result<WorkerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();

        match step.unwrap_or(Step::Run {
            lines: vec![],
            exit: 0,
        }) {
            Step::SpawnError => Err(Error::WorkerSpawn("python3: not found".into())),
            Step::Run { lines: script, exit } => {
                let mut outcome = WorkerOutcome {
                    exit_code: Some(exit),
                    ..Default::default()
                };
                for line in script {
                    match line.kind {
                        LineKind::StdoutInfo => outcome.stdout.push(line.text.clone()),
                        LineKind::StderrError => outcome.error_lines.push(line.text.clone()),
                        LineKind::StderrInfo => {}
                    }
                    let _ = lines.send(line).await;
                }
                Ok(outcome)
            }
        }
    }
}

pub fn identity(user_id: &str, role: Role, access_level: AccessLevel, allowed: &[&str]) -> Identity {
    Identity {
        user_id: user_id.into(),
        role,
        access_level,
        allowed_institutions: allowed.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn professor() -> Identity {
    identity("prof-1", Role::Professor, AccessLevel::All, &[])
}

pub fn upload_request() -> UploadRequest {
    UploadRequest {
        file_name: "plano 2024.pdf".into(),
        file_size: PDF.len() as u64,
        mime_type: "application/pdf".into(),
        institution: "Escola Técnica Estadual".into(),
        year: "2024".into(),
    }
}
