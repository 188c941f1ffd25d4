//! Orchestration of one upload from admission to terminal outcome
//!
//! Streaming flow: admit -> validate -> authorize -> temp file -> record in
//! `processing` -> worker under the retry policy -> `processed`/`error` ->
//! terminal progress event. The run lives on its own task, so a caller that
//! goes away does not change what gets persisted.
//!
//! Two-step flow: `upload_document` stores the file and creates an
//! `uploaded` record; `process_document` and `save_document` drive the rest of
//! the status machine.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::sweeper::{self, DirectoryStats, SweepOptions, SweepReport};
use super::{
    ProgressStream, ProgressStreamer, RateLimiter, RetryPolicy, TempFile, TempFileManager,
    WorkerConfig, WorkerLine, WorkerPayload, WorkerRunner,
};
use crate::config::{PipelineConfig, UploadConfig, WorkersConfig};
use crate::error::{Error, Result};
use crate::storage::DocumentStore;
use crate::types::{
    check_pdf_magic, DocumentRecord, DocumentStatus, Identity, NewDocument, ProgressEvent,
    UploadRequest, ValidatedUpload,
};

/// Per-attempt buffer between the pipe readers and the progress forwarder
const LINE_BUFFER: usize = 256;

/// Worker lines retained per run; older lines are dropped first
const MAX_RUN_LINES: usize = 5000;

/// Terminal outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Success,
    Failure,
}

#[derive(Debug)]
struct RunState {
    attempt: u32,
    lines: VecDeque<WorkerLine>,
    outcome: RunOutcome,
}

/// In-memory state of one in-flight run
#[derive(Debug)]
pub struct PipelineRun {
    pub document_id: Uuid,
    pub user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub institution: String,
    pub year: i32,
    pub started_at: Instant,
    state: Mutex<RunState>,
}

impl PipelineRun {
    fn for_record(record: &DocumentRecord, user_id: &str, file_size: u64) -> Self {
        Self {
            document_id: record.id,
            user_id: user_id.to_string(),
            file_name: record.original_name.clone(),
            file_size,
            institution: record.institution.clone(),
            year: record.year,
            started_at: Instant::now(),
            state: Mutex::new(RunState {
                attempt: 0,
                lines: VecDeque::new(),
                outcome: RunOutcome::Pending,
            }),
        }
    }

    fn begin_attempt(&self, attempt: u32) {
        self.state.lock().attempt = attempt;
    }

    fn record_line(&self, line: &WorkerLine) {
        let mut state = self.state.lock();
        if state.lines.len() == MAX_RUN_LINES {
            state.lines.pop_front();
        }
        state.lines.push_back(line.clone());
    }

    /// Set the terminal outcome; the first one wins
    fn complete(&self, outcome: RunOutcome) {
        let mut state = self.state.lock();
        if state.outcome == RunOutcome::Pending {
            state.outcome = outcome;
        }
    }

    /// Attempts started so far
    pub fn attempt(&self) -> u32 {
        self.state.lock().attempt
    }

    /// Classified worker lines across all attempts
    pub fn lines(&self) -> Vec<WorkerLine> {
        self.state.lock().lines.iter().cloned().collect()
    }

    pub fn outcome(&self) -> RunOutcome {
        self.state.lock().outcome
    }

    fn log_metrics(&self, error: Option<&str>) {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let (attempts, lines, error_lines, outcome) = {
            let state = self.state.lock();
            let error_lines = state.lines.iter().filter(|l| l.kind.is_error()).count();
            (state.attempt, state.lines.len(), error_lines, state.outcome)
        };
        let success = outcome == RunOutcome::Success;

        if success {
            tracing::info!(
                target: "extract_pipeline::metrics",
                document_id = %self.document_id,
                file = %self.file_name,
                size = self.file_size,
                institution = %self.institution,
                year = self.year,
                user = %self.user_id,
                duration_ms,
                attempts,
                lines,
                success,
                "Processing metrics"
            );
        } else {
            tracing::warn!(
                target: "extract_pipeline::metrics",
                document_id = %self.document_id,
                file = %self.file_name,
                size = self.file_size,
                institution = %self.institution,
                year = self.year,
                user = %self.user_id,
                duration_ms,
                attempts,
                lines,
                error_lines,
                success,
                error = error.unwrap_or(""),
                "Processing metrics"
            );
        }
    }
}

/// Outcome of the two-step process route
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub success: bool,
    pub outcome: RunOutcome,
    /// Worker attempts the run needed
    pub attempts: u32,
    pub document: DocumentRecord,
    /// Every progress event of the run, in order
    pub events: Vec<ProgressEvent>,
}

/// Sweep of the temp directory with stats on both sides
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub dry_run: bool,
    pub max_age_hours: f64,
    pub result: SweepReport,
    pub before: DirectoryStats,
    pub after: DirectoryStats,
}

/// A caller that passed the rate limiter and may submit one streaming run
#[derive(Debug)]
pub struct Admission {
    identity: Identity,
}

impl Admission {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Upload and extraction orchestrator
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    store: Arc<DocumentStore>,
    limiter: Arc<RateLimiter>,
    temp_files: TempFileManager,
    documents: TempFileManager,
    runner: Arc<dyn WorkerRunner>,
    retry: RetryPolicy,
    workers: WorkersConfig,
    uploads: UploadConfig,
    permits: Option<Semaphore>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<DocumentStore>,
        limiter: Arc<RateLimiter>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        let permits = config.workers.max_concurrent.map(|n| Semaphore::new(n.max(1)));

        Self {
            inner: Arc::new(PipelineInner {
                store,
                limiter,
                temp_files: TempFileManager::new(&config.uploads.temp_dir),
                documents: TempFileManager::new(&config.uploads.storage_dir),
                runner,
                retry: RetryPolicy::new(config.retry.clone()),
                workers: config.workers.clone(),
                uploads: config.uploads.clone(),
                permits,
            }),
        }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.inner.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn upload_limits(&self) -> &UploadConfig {
        &self.inner.uploads
    }

    pub fn temp_dir(&self) -> &Path {
        self.inner.temp_files.dir()
    }

    /// Create the upload directories
    pub async fn ensure_dirs(&self) -> Result<()> {
        self.inner.temp_files.ensure_dir().await?;
        self.inner.documents.ensure_dir().await
    }

    /// Rate-limit a caller before anything else about its request is read
    pub fn admit(&self, identity: Identity) -> Result<Admission> {
        self.check_rate(&identity)?;
        Ok(Admission { identity })
    }

    /// Streaming flow; returns once the run is started
    pub async fn submit_stream(
        &self,
        admission: Admission,
        request: UploadRequest,
        bytes: &[u8],
    ) -> Result<ProgressStream> {
        let identity = admission.identity();
        let upload = self.validate_upload(identity, &request, bytes)?;

        let temp = self.inner.temp_files.create(bytes, &upload.original_name).await?;
        tracing::info!(
            "File uploaded: {} ({} bytes) for {} / {} by {}",
            upload.sanitized_name,
            bytes.len(),
            upload.institution,
            upload.year,
            identity.user_id
        );

        // Dropping `temp` on any error below removes the file
        let record = self
            .inner
            .store
            .create_processing(new_document(identity, &upload, temp.path()))?;

        let run = PipelineRun::for_record(&record, &identity.user_id, bytes.len() as u64);
        let (streamer, stream) = ProgressStreamer::open("Starting pipeline");

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run_stream(run, temp, streamer).await;
        });

        Ok(stream)
    }

    async fn run_stream(self, run: PipelineRun, temp: TempFile, streamer: ProgressStreamer) {
        tracing::info!("Run started for document {}", run.document_id);

        let result = self
            .execute(&self.inner.workers.stream, temp.path(), &run, &streamer)
            .await;

        if let Err(e) = temp.release().await {
            tracing::error!("Temp file for {} left behind: {}", run.document_id, e);
        }

        if let Err(e) = self.finish(&run, result, streamer) {
            tracing::error!("Run for document {} could not be recorded: {}", run.document_id, e);
        }
    }

    /// Two-step flow, step one: store the file and create an `uploaded` record
    pub async fn upload_document(
        &self,
        identity: &Identity,
        request: UploadRequest,
        bytes: &[u8],
    ) -> Result<DocumentRecord> {
        let upload = self.validate_upload(identity, &request, bytes)?;

        let file = self.inner.documents.create(bytes, &upload.original_name).await?;
        let record = self
            .inner
            .store
            .create(new_document(identity, &upload, file.path()))?;
        let stored = file.keep();

        tracing::info!(
            "Document {} stored at {} for {} / {}",
            record.id,
            stored.display(),
            record.institution,
            record.year
        );
        Ok(record)
    }

    /// Two-step flow, step two: run the payload worker on an `uploaded` record
    pub async fn process_document(&self, identity: &Identity, id: Uuid) -> Result<ProcessReport> {
        self.check_rate(identity)?;

        let record = self.inner.store.require(id)?;
        authorize(identity, &record.institution_code, "process")?;
        let record = self.inner.store.begin_processing(id)?;

        let file_size = tokio::fs::metadata(&record.stored_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let run = PipelineRun::for_record(&record, &identity.user_id, file_size);

        // Own task so a dropped request cannot strand the record in `processing`
        let pipeline = self.clone();
        tokio::spawn(async move {
            let (streamer, stream) = ProgressStreamer::open("Starting extraction");
            let result = pipeline
                .execute(
                    &pipeline.inner.workers.extract,
                    &record.stored_path,
                    &run,
                    &streamer,
                )
                .await;

            let document = pipeline.finish(&run, result, streamer)?;
            let events: Vec<ProgressEvent> = stream.collect().await;
            let outcome = run.outcome();

            Ok::<_, Error>(ProcessReport {
                success: outcome == RunOutcome::Success,
                outcome,
                attempts: run.attempt(),
                document,
                events,
            })
        })
        .await
        .map_err(|e| Error::internal(format!("Processing task failed: {}", e)))?
    }

    /// Two-step flow, step three: promote a processed record with approved data
    pub fn save_document(
        &self,
        identity: &Identity,
        id: Uuid,
        approved: &serde_json::Value,
    ) -> Result<DocumentRecord> {
        let record = self.inner.store.require(id)?;
        authorize(identity, &record.institution_code, "save")?;

        let saved = self.inner.store.mark_saved(id, approved)?;
        tracing::info!(
            "Document {} saved for {} / {} by {}",
            id,
            saved.institution,
            saved.year,
            identity.user_id
        );
        Ok(saved)
    }

    pub fn get_document(&self, identity: &Identity, id: Uuid) -> Result<DocumentRecord> {
        let record = self.inner.store.require(id)?;
        authorize(identity, &record.institution_code, "read")?;
        Ok(record)
    }

    /// Records visible to `identity`, newest first
    pub fn list_documents(
        &self,
        identity: &Identity,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .inner
            .store
            .list(status)?
            .into_iter()
            .filter(|r| identity.can_access(&r.institution_code))
            .collect())
    }

    /// Remove a record and its stored file
    pub async fn delete_document(&self, identity: &Identity, id: Uuid) -> Result<DocumentRecord> {
        let record = self.inner.store.require(id)?;
        authorize(identity, &record.institution_code, "delete")?;
        if record.status == DocumentStatus::Processing {
            return Err(Error::Conflict(format!("document {} is being processed", id)));
        }

        let removed = self
            .inner
            .store
            .delete(id)?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;

        match tokio::fs::remove_file(&removed.stored_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Stored file {} not removed: {}",
                removed.stored_path.display(),
                e
            ),
        }

        tracing::info!("Document {} deleted by {}", id, identity.user_id);
        Ok(removed)
    }

    /// Sweep the temp directory, reporting stats before and after
    pub async fn cleanup(&self, options: SweepOptions) -> Result<CleanupReport> {
        let dir = self.temp_dir();
        let before = sweeper::directory_stats(dir).await?;
        let result = sweeper::sweep(dir, options).await?;
        let after = sweeper::directory_stats(dir).await?;

        Ok(CleanupReport {
            dry_run: options.dry_run,
            max_age_hours: options.max_age_hours,
            result,
            before,
            after,
        })
    }

    fn check_rate(&self, identity: &Identity) -> Result<()> {
        if self.inner.limiter.check_and_record(&identity.user_id) {
            return Ok(());
        }

        let wait = self.inner.limiter.retry_after(&identity.user_id);
        let retry_after_secs = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
        tracing::warn!(
            "Rate limit exceeded for {} ({} uploads per window), retry after {}s",
            identity.user_id,
            self.inner.limiter.limit(),
            retry_after_secs
        );
        Err(Error::RateLimited { retry_after_secs })
    }

    fn validate_upload(
        &self,
        identity: &Identity,
        request: &UploadRequest,
        bytes: &[u8],
    ) -> Result<ValidatedUpload> {
        let upload = request.validate(&self.inner.uploads)?;
        authorize(identity, &upload.institution_code, "upload")?;
        check_pdf_magic(bytes)?;
        Ok(upload)
    }

    /// Run one worker kind under the retry policy, forwarding its lines
    async fn execute(
        &self,
        config: &WorkerConfig,
        input: &Path,
        run: &PipelineRun,
        streamer: &ProgressStreamer,
    ) -> Result<Option<WorkerPayload>> {
        let command = config.command(input, &run.institution, run.year);
        let max_attempts = self.inner.retry.max_attempts();
        let inner = &*self.inner;
        let command = &command;

        self.inner
            .retry
            .execute(
                move |attempt| async move {
                    let _permit = match &inner.permits {
                        Some(permits) => Some(permits.acquire().await.map_err(|e| {
                            Error::internal(format!("Worker permits closed: {}", e))
                        })?),
                        None => None,
                    };

                    run.begin_attempt(attempt);
                    tracing::info!(
                        "Worker attempt {}/{}: {} {:?}",
                        attempt,
                        max_attempts,
                        command.program,
                        command.args
                    );

                    let (tx, mut rx) = mpsc::channel::<WorkerLine>(LINE_BUFFER);
                    let forward = async {
                        while let Some(line) = rx.recv().await {
                            run.record_line(&line);
                            streamer.line(line.text, line.kind, attempt);
                        }
                    };
                    let (outcome, ()) = tokio::join!(inner.runner.run(command, tx), forward);

                    let outcome = outcome?.into_result()?;
                    if config.expect_payload {
                        WorkerPayload::parse(&outcome.stdout).map(Some)
                    } else {
                        Ok(None)
                    }
                },
                |attempt, err, delay| {
                    streamer.retrying(
                        format!("Attempt {}/{} failed: {}", attempt, max_attempts, err),
                        attempt,
                        max_attempts,
                        delay.as_millis() as u64,
                    )
                },
            )
            .await
    }

    /// Persist the outcome, then emit the terminal event
    fn finish(
        &self,
        run: &PipelineRun,
        result: Result<Option<WorkerPayload>>,
        streamer: ProgressStreamer,
    ) -> Result<DocumentRecord> {
        let id = run.document_id;
        if !streamer.is_connected() {
            tracing::info!(
                "Client for document {} left after {} events; recording outcome anyway",
                id,
                streamer.emitted()
            );
        }

        match result {
            Ok(payload) => {
                let (extracted, normalized) = payload
                    .map(|p| (p.extracted_data, p.normalized_data))
                    .unwrap_or((None, None));

                match self
                    .inner
                    .store
                    .mark_processed(id, extracted.as_ref(), normalized.as_ref())
                {
                    Ok(record) => {
                        run.complete(RunOutcome::Success);
                        run.log_metrics(None);
                        streamer.success("Processing completed successfully", Some(id));
                        Ok(record)
                    }
                    Err(e) => {
                        let message = format!("Failed to record result: {}", e);
                        run.complete(RunOutcome::Failure);
                        run.log_metrics(Some(&message));
                        streamer.failure(message, Some(id));
                        Err(e)
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("Document {} failed: {}", id, message);
                run.complete(RunOutcome::Failure);
                run.log_metrics(Some(&message));

                let persisted = self.inner.store.mark_error(id, &message);
                streamer.failure(message, Some(id));
                persisted
            }
        }
    }
}

fn new_document(identity: &Identity, upload: &ValidatedUpload, path: &Path) -> NewDocument {
    NewDocument {
        institution: upload.institution.clone(),
        institution_code: upload.institution_code.clone(),
        year: upload.year,
        original_name: upload.original_name.clone(),
        stored_path: PathBuf::from(path),
        uploaded_by: Some(identity.user_id.clone()),
    }
}

/// Access-control decision for one institution, logged either way
fn authorize(identity: &Identity, institution_code: &str, action: &str) -> Result<()> {
    let granted = identity.can_access(institution_code);
    tracing::info!(
        target: "extract_pipeline::access",
        user = %identity.user_id,
        role = ?identity.role,
        institution = %institution_code,
        action,
        granted,
        "Access control"
    );

    if granted {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "no access to institution {}",
            institution_code
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::RetryConfig;
    use crate::testing::{err_line, identity, out, professor, upload_request, ScriptedRunner, Step, PDF};
    use crate::types::{AccessLevel, LineKind, Role};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        pipeline: Pipeline,
        runner: Arc<ScriptedRunner>,
        dir: TempDir,
    }

    impl Harness {
        fn new(steps: Vec<Step>) -> Self {
            Self::with_limit(steps, 15)
        }

        fn with_limit(steps: Vec<Step>, max_uploads: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = PipelineConfig::default();
            config.uploads.temp_dir = dir.path().join("uploads");
            config.uploads.storage_dir = dir.path().join("documents");
            config.rate_limit.max_uploads = max_uploads;
            config.retry = RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_factor: 2.0,
            };

            let store = Arc::new(DocumentStore::in_memory().unwrap());
            let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
            let runner = Arc::new(ScriptedRunner::new(steps));
            let pipeline = Pipeline::new(&config, store, limiter, runner.clone());

            Self {
                pipeline,
                runner,
                dir,
            }
        }

        fn files_in(&self, sub: &str) -> usize {
            std::fs::read_dir(self.dir.path().join(sub))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    async fn submit(
        pipeline: &Pipeline,
        identity: &Identity,
        request: UploadRequest,
        bytes: &[u8],
    ) -> Result<ProgressStream> {
        let admission = pipeline.admit(identity.clone())?;
        pipeline.submit_stream(admission, request, bytes).await
    }

    async fn collect(stream: ProgressStream) -> Vec<ProgressEvent> {
        stream.collect().await
    }

    fn statuses(events: &[ProgressEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.status()).collect()
    }

    fn document_id(events: &[ProgressEvent]) -> Uuid {
        match events.last() {
            Some(ProgressEvent::Success { document_id, .. })
            | Some(ProgressEvent::Failure { document_id, .. }) => document_id.unwrap(),
            other => panic!("no terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_succeeds_after_retry() {
        let h = Harness::new(vec![
            Step::Run {
                lines: vec![out("page 1/2")],
                exit: 1,
            },
            Step::Run {
                lines: vec![out("page 1/2"), out("page 2/2")],
                exit: 0,
            },
        ]);

        let stream = submit(&h.pipeline, &professor(), upload_request(), PDF)
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(
            statuses(&events),
            vec!["starting", "processing", "retrying", "processing", "processing", "success"]
        );
        assert_eq!(h.runner.calls(), 2);

        let record = h.pipeline.store().require(document_id(&events)).unwrap();
        assert_eq!(record.status, DocumentStatus::Processed);
        assert_eq!(record.institution_code, "escola-tecnica-estadual");
        assert_eq!(h.files_in("uploads"), 0);
    }

    #[tokio::test]
    async fn test_stream_fails_after_all_attempts() {
        let h = Harness::new(vec![Step::SpawnError, Step::SpawnError, Step::SpawnError]);

        let stream = submit(&h.pipeline, &professor(), upload_request(), PDF)
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(
            statuses(&events),
            vec!["starting", "retrying", "retrying", "failure"]
        );
        assert_eq!(h.runner.calls(), 3);

        let record = h.pipeline.store().require(document_id(&events)).unwrap();
        assert_eq!(record.status, DocumentStatus::Error);
        assert!(record.error.unwrap().contains("python3: not found"));
        assert_eq!(h.files_in("uploads"), 0);
    }

    #[tokio::test]
    async fn test_error_marked_line_fails_attempt_despite_exit_zero() {
        let h = Harness::new(vec![
            Step::Run {
                lines: vec![err_line("x - ERROR - ocr failed")],
                exit: 0,
            },
            Step::Run {
                lines: vec![],
                exit: 0,
            },
        ]);

        let stream = submit(&h.pipeline, &professor(), upload_request(), PDF)
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(
            statuses(&events),
            vec!["starting", "processing", "retrying", "success"]
        );
        assert_eq!(h.runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_result_write_still_ends_in_one_failure() {
        let h = Harness::new(vec![]);
        h.pipeline
            .store()
            .execute_batch(
                "CREATE TRIGGER fail_processed BEFORE UPDATE OF status ON documents
                 WHEN NEW.status = 'processed'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let stream = submit(&h.pipeline, &professor(), upload_request(), PDF)
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(statuses(&events), vec!["starting", "failure"]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        match events.last() {
            Some(ProgressEvent::Failure { message, .. }) => {
                assert!(message.contains("Failed to record result"), "{}", message)
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // Neither `processed` nor a guessed `error`
        let record = h.pipeline.store().require(document_id(&events)).unwrap();
        assert_eq!(record.status, DocumentStatus::Processing);
        assert_eq!(h.files_in("uploads"), 0);
    }

    #[test]
    fn test_run_tracks_attempts_lines_and_outcome() {
        let record = DocumentRecord::processing(NewDocument {
            institution: "Escola".into(),
            institution_code: "escola".into(),
            year: 2024,
            original_name: "plano.pdf".into(),
            stored_path: PathBuf::from("/tmp/plano.pdf"),
            uploaded_by: None,
        });
        let run = PipelineRun::for_record(&record, "prof-1", 10);
        assert_eq!(run.outcome(), RunOutcome::Pending);
        assert_eq!(run.attempt(), 0);

        run.begin_attempt(1);
        run.record_line(&WorkerLine {
            kind: LineKind::StderrError,
            text: "x - ERROR - ocr".into(),
        });
        run.begin_attempt(2);
        for i in 0..MAX_RUN_LINES {
            run.record_line(&WorkerLine {
                kind: LineKind::StdoutInfo,
                text: format!("page {}", i),
            });
        }

        let lines = run.lines();
        assert_eq!(run.attempt(), 2);
        assert_eq!(lines.len(), MAX_RUN_LINES);
        assert_eq!(lines[0].text, "page 0");

        run.complete(RunOutcome::Failure);
        run.complete(RunOutcome::Success);
        assert_eq!(run.outcome(), RunOutcome::Failure);
    }

    #[tokio::test]
    async fn test_run_completes_without_consumer() {
        let h = Harness::new(vec![]);
        let stream = submit(&h.pipeline, &professor(), upload_request(), PDF)
            .await
            .unwrap();
        drop(stream);

        let mut status = None;
        for _ in 0..200 {
            let records = h.pipeline.store().list(None).unwrap();
            status = records.first().map(|r| r.status);
            if status == Some(DocumentStatus::Processed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, Some(DocumentStatus::Processed));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_any_work() {
        let h = Harness::with_limit(vec![], 1);
        let identity = professor();

        let first = submit(&h.pipeline, &identity, upload_request(), PDF).await.unwrap();
        collect(first).await;

        let err = h.pipeline.admit(identity.clone()).unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs } if retry_after_secs > 0));
        assert_eq!(h.pipeline.store().list(None).unwrap().len(), 1);
        assert_eq!(h.files_in("uploads"), 0);

        // Two-step processing counts against the same window
        let record = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        assert!(matches!(
            h.pipeline.process_document(&identity, record.id).await,
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_access_control_and_validation() {
        let h = Harness::new(vec![]);

        let restricted = identity("prof-2", Role::Professor, AccessLevel::Specific, &["outra-escola"]);
        let err = submit(&h.pipeline, &restricted, upload_request(), PDF)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let err = submit(&h.pipeline, &professor(), upload_request(), b"GIF89a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut bad = upload_request();
        bad.year = "1999".into();
        let err = submit(&h.pipeline, &professor(), bad, PDF)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(h.runner.calls(), 0);
        assert_eq!(h.files_in("uploads"), 0);
        assert!(h.pipeline.store().list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_step_flow_with_save_conflict() {
        let payload = r#"{"success": true, "extractedData": {"pages": 2}, "normalizedData": {"escola": "ETE"}}"#;
        let h = Harness::new(vec![
            Step::Run {
                lines: vec![out(payload)],
                exit: 0,
            },
            Step::Run {
                lines: vec![out(payload)],
                exit: 0,
            },
        ]);
        let identity = professor();

        let first = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        assert_eq!(first.status, DocumentStatus::Uploaded);
        assert!(first.stored_path.exists());
        assert_eq!(h.files_in("documents"), 1);

        let report = h.pipeline.process_document(&identity, first.id).await.unwrap();
        assert!(report.success);
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.document.status, DocumentStatus::Processed);
        assert_eq!(
            report.document.normalized_data,
            Some(serde_json::json!({"escola": "ETE"}))
        );
        assert_eq!(statuses(&report.events).last(), Some(&"success"));

        let approved = serde_json::json!({"escola": "ETE", "revisado": true});
        let saved = h
            .pipeline
            .save_document(&identity, first.id, &approved)
            .unwrap();
        assert_eq!(saved.status, DocumentStatus::Saved);
        assert_eq!(saved.normalized_data, Some(approved));

        let second = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        h.pipeline.process_document(&identity, second.id).await.unwrap();
        let err = h
            .pipeline
            .save_document(&identity, second.id, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_process_requires_uploaded_status() {
        let h = Harness::new(vec![Step::Run {
            lines: vec![out(r#"{"success": true}"#)],
            exit: 0,
        }]);
        let identity = professor();

        let record = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        h.pipeline.process_document(&identity, record.id).await.unwrap();

        let err = h
            .pipeline
            .process_document(&identity, record.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_process_failure_marks_error() {
        let h = Harness::new(vec![
            Step::Run {
                lines: vec![out("not json")],
                exit: 0,
            },
            Step::Run {
                lines: vec![out("not json")],
                exit: 0,
            },
            Step::Run {
                lines: vec![],
                exit: 2,
            },
        ]);
        let identity = professor();

        let record = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        let report = h.pipeline.process_document(&identity, record.id).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.document.status, DocumentStatus::Error);
        assert_eq!(h.runner.calls(), 3);
        assert_eq!(
            report
                .events
                .iter()
                .filter(|e| e.status() == "retrying")
                .count(),
            2
        );
        assert!(record.stored_path.exists());
    }

    #[tokio::test]
    async fn test_delete_removes_stored_file() {
        let h = Harness::new(vec![]);
        let identity = professor();

        let record = h
            .pipeline
            .upload_document(&identity, upload_request(), PDF)
            .await
            .unwrap();
        h.pipeline.delete_document(&identity, record.id).await.unwrap();

        assert!(!record.stored_path.exists());
        assert!(matches!(
            h.pipeline.get_document(&identity, record.id),
            Err(Error::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_access() {
        let h = Harness::new(vec![]);
        h.pipeline
            .upload_document(&professor(), upload_request(), PDF)
            .await
            .unwrap();

        let outsider = identity("dir-1", Role::Diretor, AccessLevel::Specific, &["outra-escola"]);
        assert!(h.pipeline.list_documents(&outsider, None).unwrap().is_empty());
        assert_eq!(h.pipeline.list_documents(&professor(), None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.uploads.temp_dir = dir.path().join("uploads");
        config.uploads.storage_dir = dir.path().join("documents");
        config.workers.max_concurrent = Some(1);

        let pipeline = Pipeline::new(
            &config,
            Arc::new(DocumentStore::in_memory().unwrap()),
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
            Arc::new(ScriptedRunner::new(vec![])),
        );

        let a = submit(&pipeline, &professor(), upload_request(), PDF).await.unwrap();
        let b = submit(&pipeline, &professor(), upload_request(), PDF).await.unwrap();
        let (a, b) = tokio::join!(collect(a), collect(b));
        assert_eq!(statuses(&a).last(), Some(&"success"));
        assert_eq!(statuses(&b).last(), Some(&"success"));
    }

    #[tokio::test]
    async fn test_cleanup_reports_stats() {
        let h = Harness::new(vec![]);
        h.pipeline.ensure_dirs().await.unwrap();
        std::fs::write(h.dir.path().join("uploads").join("orphan.pdf"), b"%PDF-").unwrap();

        let report = h
            .pipeline
            .cleanup(SweepOptions {
                max_age_hours: 24.0,
                dry_run: true,
            })
            .await
            .unwrap();

        assert_eq!(report.before.file_count, 1);
        assert_eq!(report.after.file_count, 1);
        assert_eq!(report.result.files_deleted, 0);
    }
}
