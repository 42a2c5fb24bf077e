//! Import job orchestration: admission, the per-chunk loop, and job control.
//!
//! Each admitted job runs on its own tokio task. Reading and parsing a chunk is
//! CPU-bound and goes to the rayon [`WorkerPool`]; the chunk's merge and
//! checkpoint are then committed through the [`Store`] in one transaction.
//! Pause and cancel requests are honoured between chunks only.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::download::{hash_file, BulkSource};
use super::job::{ChunkCheckpoint, ImportJob, JobControl, JobSnapshot, JobStatus};
use super::parser::{ParsedBatch, RecordParser};
use super::reader::{read_chunks, stage_source, ChunkedReader, ReadOffset};
use super::schema::{validate_cycle, DataType};
use crate::config::ImportConfig;
use crate::database_ops::Store;
use crate::error::{ImportError, Result};

/// Bounded rayon pool for CPU-bound work, awaited from async code.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("fec-parse-{i}"))
            .build()
            .map_err(|e| ImportError::WorkerPool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| ImportError::WorkerPool("worker dropped the task".into()))
    }
}

#[derive(Debug, Default)]
struct JobSignals {
    cancel: AtomicBool,
    pause: AtomicBool,
}

/// Jobs admitted in this process, with their cooperative control flags.
struct JobRegistry {
    limit: usize,
    active: Mutex<HashMap<String, Arc<JobSignals>>>,
}

impl JobRegistry {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<JobSignals>>> {
        // A poisoned map is still structurally valid.
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn admit(self: &Arc<Self>, job_id: &str) -> Result<Admission> {
        let mut active = self.guard();
        if active.contains_key(job_id) {
            return Err(ImportError::ResourceLimit(format!(
                "job {job_id} is already running"
            )));
        }
        if active.len() >= self.limit {
            return Err(ImportError::ResourceLimit(format!(
                "{} import jobs already running (limit {})",
                active.len(),
                self.limit
            )));
        }
        let signals = Arc::new(JobSignals::default());
        active.insert(job_id.to_string(), signals.clone());
        Ok(Admission {
            registry: self.clone(),
            job_id: job_id.to_string(),
            signals,
        })
    }

    fn signals(&self, job_id: &str) -> Option<Arc<JobSignals>> {
        self.guard().get(job_id).cloned()
    }

    fn active_count(&self) -> usize {
        self.guard().len()
    }
}

/// Slot in the registry, released when the job task ends.
struct Admission {
    registry: Arc<JobRegistry>,
    job_id: String,
    signals: Arc<JobSignals>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.guard().remove(&self.job_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    LocalFile(PathBuf),
    /// Fetch from the FEC bulk site, reusing an earlier download unless forced.
    Download { force: bool },
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub data_type: DataType,
    pub cycle: i32,
    pub source: ImportSource,
    pub chunk_size: Option<usize>,
}

pub struct ImportHandle {
    pub job_id: String,
    join: JoinHandle<Result<JobSnapshot>>,
}

impl ImportHandle {
    /// Wait for the job to stop. A job that ends `failed` yields the error that
    /// failed it, after it was recorded on the job.
    pub async fn wait(self) -> Result<JobSnapshot> {
        self.join
            .await
            .map_err(|e| ImportError::WorkerPool(format!("import task ended abnormally: {e}")))?
    }

    #[cfg(test)]
    fn abort(&self) {
        self.join.abort();
    }
}

enum Prepared {
    Ready,
    /// Freshly downloaded content identical to an already imported file.
    AlreadyImported,
}

struct ChunkRead {
    end: ReadOffset,
    lines_consumed: u64,
    malformed: u64,
    parsed: ParsedBatch,
}

struct Inner {
    store: Arc<dyn Store>,
    config: ImportConfig,
    source: Option<BulkSource>,
    workers: WorkerPool,
    registry: Arc<JobRegistry>,
}

#[derive(Clone)]
pub struct ImportController {
    inner: Arc<Inner>,
}

impl ImportController {
    pub fn new(
        store: Arc<dyn Store>,
        config: ImportConfig,
        source: Option<BulkSource>,
    ) -> Result<Self> {
        let workers = WorkerPool::new(config.parse_workers)?;
        let registry = Arc::new(JobRegistry::new(config.max_concurrent_jobs));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                source,
                workers,
                registry,
            }),
        })
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Admit and launch an import. Rejections happen before any job row exists.
    pub async fn start_import(&self, req: ImportRequest) -> Result<ImportHandle> {
        let cycle = validate_cycle(req.cycle).map_err(ImportError::Source)?;
        let mut job = ImportJob::new(req.data_type, cycle);
        let admission = self.inner.registry.admit(&job.job_id)?;
        self.inner.check_size(req.data_type, cycle, &req.source).await?;
        if let ImportSource::LocalFile(path) = &req.source {
            job.file_path = Some(path.clone());
        }
        self.inner
            .store
            .insert_job(&job)
            .await
            .map_err(ImportError::from_storage)?;
        info!(
            target: "fec::import",
            job_id = %job.job_id,
            data_type = %job.data_type,
            cycle,
            "import job admitted"
        );
        let chunk_size = req.chunk_size.unwrap_or(self.inner.config.chunk_size);
        Ok(self.spawn(job, req.source, chunk_size, admission))
    }

    /// Continue a paused job under the same id from its committed offset.
    pub async fn resume_job(&self, job_id: &str) -> Result<ImportHandle> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(ImportError::InvalidTransition {
                job_id: job.job_id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let path = job.file_path.clone().ok_or_else(|| {
            ImportError::Source(anyhow::anyhow!("paused job {job_id} has no source file"))
        })?;
        self.inner.verify_source(&job, &path).await?;
        let admission = self.inner.registry.admit(&job.job_id)?;
        info!(target: "fec::import", job_id, line = job.line_offset, "resuming paused job");
        let chunk_size = self.inner.config.chunk_size;
        Ok(self.spawn(job, ImportSource::LocalFile(path), chunk_size, admission))
    }

    /// Start a new job continuing a failed or cancelled one: same file, offset
    /// and counters, linked through `resumed_from`.
    pub async fn retry_job(&self, job_id: &str) -> Result<ImportHandle> {
        let prior = self.load(job_id).await?;
        if !matches!(prior.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(ImportError::InvalidTransition {
                job_id: prior.job_id,
                from: prior.status,
                to: JobStatus::Pending,
            });
        }
        if let Some(path) = &prior.file_path {
            self.inner.verify_source(&prior, path).await?;
        }
        let job = ImportJob::continuation_of(&prior);
        let admission = self.inner.registry.admit(&job.job_id)?;
        self.inner
            .store
            .insert_job(&job)
            .await
            .map_err(ImportError::from_storage)?;
        let source = match &job.file_path {
            Some(path) => ImportSource::LocalFile(path.clone()),
            None => ImportSource::Download { force: false },
        };
        info!(
            target: "fec::import",
            job_id = %job.job_id,
            resumed_from = job_id,
            line = job.line_offset,
            "retrying import job"
        );
        let chunk_size = self.inner.config.chunk_size;
        Ok(self.spawn(job, source, chunk_size, admission))
    }

    /// Request cancellation. Returns false when the job is unknown or already
    /// terminal; repeated calls on a live job keep returning true.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let store = &self.inner.store;
        if let Some(signals) = self.inner.registry.signals(job_id) {
            signals.cancel.store(true, Ordering::SeqCst);
            return store
                .set_control_request(job_id, JobControl::Cancel)
                .await
                .map_err(ImportError::from_storage);
        }
        let Some(mut job) = store.load_job(job_id).await.map_err(ImportError::from_storage)? else {
            return Ok(false);
        };
        match job.status {
            s if s.is_terminal() => Ok(false),
            // Nothing in this process is driving it; cancel it directly.
            JobStatus::Paused | JobStatus::Pending => {
                job.transition(JobStatus::Cancelled)?;
                let changed = store
                    .update_job_state(&job)
                    .await
                    .map_err(ImportError::from_storage)?;
                if changed {
                    info!(target: "fec::import", job_id, "idle job cancelled");
                }
                Ok(changed)
            }
            _ => store
                .set_control_request(job_id, JobControl::Cancel)
                .await
                .map_err(ImportError::from_storage),
        }
    }

    /// Request a pause at the next chunk boundary. Returns false unless the job
    /// is running (or already paused).
    pub async fn pause_job(&self, job_id: &str) -> Result<bool> {
        let store = &self.inner.store;
        if let Some(signals) = self.inner.registry.signals(job_id) {
            signals.pause.store(true, Ordering::SeqCst);
            return store
                .set_control_request(job_id, JobControl::Pause)
                .await
                .map_err(ImportError::from_storage);
        }
        let Some(job) = store.load_job(job_id).await.map_err(ImportError::from_storage)? else {
            return Ok(false);
        };
        match job.status {
            JobStatus::Paused => Ok(true),
            JobStatus::Running => store
                .set_control_request(job_id, JobControl::Pause)
                .await
                .map_err(ImportError::from_storage),
            _ => Ok(false),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobSnapshot> {
        Ok(self.load(job_id).await?.snapshot())
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobSnapshot>> {
        let jobs = self
            .inner
            .store
            .list_jobs(limit)
            .await
            .map_err(ImportError::from_storage)?;
        Ok(jobs.iter().map(ImportJob::snapshot).collect())
    }

    /// Settle jobs a previous process left mid-flight.
    ///
    /// Running jobs become paused at their last committed offset and can be
    /// resumed; pending jobs never started reading and are failed so they can be
    /// retried. Call once at startup, before any import is admitted.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let store = &self.inner.store;
        let stranded = store
            .jobs_in_status(&[JobStatus::Running, JobStatus::Pending])
            .await
            .map_err(ImportError::from_storage)?;
        let mut recovered = Vec::new();
        for mut job in stranded {
            if self.inner.registry.signals(&job.job_id).is_some() {
                continue;
            }
            let target = if job.status == JobStatus::Running {
                JobStatus::Paused
            } else {
                job.error_message = Some("interrupted before the import started".into());
                JobStatus::Failed
            };
            job.transition(target)?;
            store
                .update_job_state(&job)
                .await
                .map_err(ImportError::from_storage)?;
            warn!(
                target: "fec::import",
                job_id = %job.job_id,
                status = %job.status,
                line = job.line_offset,
                "recovered interrupted job"
            );
            recovered.push(job.job_id);
        }
        Ok(recovered)
    }

    async fn load(&self, job_id: &str) -> Result<ImportJob> {
        self.inner
            .store
            .load_job(job_id)
            .await
            .map_err(ImportError::from_storage)?
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))
    }

    fn spawn(
        &self,
        job: ImportJob,
        source: ImportSource,
        chunk_size: usize,
        admission: Admission,
    ) -> ImportHandle {
        let inner = self.inner.clone();
        let job_id = job.job_id.clone();
        let span = info_span!(
            "import_job",
            job_id = %job.job_id,
            data_type = %job.data_type,
            cycle = job.cycle
        );
        let join = tokio::spawn(
            async move {
                let result = inner.run(job, source, chunk_size, &admission.signals).await;
                drop(admission);
                result
            }
            .instrument(span),
        );
        ImportHandle { job_id, join }
    }
}

impl Inner {
    async fn check_size(&self, data_type: DataType, cycle: i32, source: &ImportSource) -> Result<()> {
        let limit = self.config.max_file_bytes;
        let size = match source {
            ImportSource::LocalFile(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
            ImportSource::Download { force } => {
                let Some(bulk) = &self.source else {
                    return Ok(());
                };
                let have_local = !force
                    && self
                        .store
                        .latest_file_metadata(data_type, cycle)
                        .await
                        .map_err(ImportError::from_storage)?
                        .is_some_and(|m| m.file_path.exists());
                if have_local {
                    None
                } else {
                    match bulk.probe(data_type, cycle).await {
                        Ok(info) => info.content_length,
                        Err(err) => {
                            warn!(target: "fec::import", error = %format!("{err:#}"), "size probe failed; relying on download limit");
                            None
                        }
                    }
                }
            }
        };
        match size {
            Some(bytes) if bytes > limit => Err(ImportError::ResourceLimit(format!(
                "{data_type} {cycle} source is {bytes} bytes, above the {limit} byte limit"
            ))),
            _ => Ok(()),
        }
    }

    async fn persist(&self, job: &ImportJob) -> Result<()> {
        self.store
            .update_job_state(job)
            .await
            .map_err(ImportError::from_storage)?;
        Ok(())
    }

    async fn run(
        &self,
        mut job: ImportJob,
        source: ImportSource,
        chunk_size: usize,
        signals: &JobSignals,
    ) -> Result<JobSnapshot> {
        match self.drive(&mut job, source, chunk_size, signals).await {
            Ok(()) => Ok(job.snapshot()),
            Err(err) => {
                error!(
                    target: "fec::import",
                    job_id = %job.job_id,
                    line = job.line_offset,
                    error = %err,
                    "import job failed"
                );
                job.error_message = Some(err.to_string());
                match job.transition(JobStatus::Failed) {
                    Ok(()) => {
                        if let Err(persist_err) = self.persist(&job).await {
                            error!(
                                target: "fec::import",
                                job_id = %job.job_id,
                                error = %persist_err,
                                "could not record job failure"
                            );
                        }
                    }
                    Err(transition_err) => {
                        warn!(target: "fec::import", error = %transition_err, "failure after job stopped");
                    }
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        job: &mut ImportJob,
        source: ImportSource,
        chunk_size: usize,
        signals: &JobSignals,
    ) -> Result<()> {
        if job.status == JobStatus::Pending {
            if signals.cancel.load(Ordering::SeqCst) {
                return self.stop(job, JobStatus::Cancelled).await;
            }
            match self.prepare_source(job, &source).await? {
                Prepared::Ready => {}
                Prepared::AlreadyImported => {
                    info!(
                        target: "fec::import",
                        job_id = %job.job_id,
                        "downloaded file matches an imported one; nothing to do"
                    );
                    job.transition(JobStatus::Running)?;
                    self.persist(job).await?;
                    return self.stop(job, JobStatus::Completed).await;
                }
            }
        }
        let path = job.file_path.clone().ok_or_else(|| {
            ImportError::Source(anyhow::anyhow!("job {} has no source file", job.job_id))
        })?;

        job.transition(JobStatus::Running)?;
        self.persist(job).await?;

        let (reader, parser) = self.open(job, &path, chunk_size).await?;
        let parser = Arc::new(parser);
        let mut stream = Some(reader);
        let schema = parser.schema();
        info!(
            target: "fec::import",
            job_id = %job.job_id,
            file = %path.display(),
            line = job.line_offset,
            chunk_size,
            "import running"
        );

        loop {
            if let Some(stop_as) = self.requested_stop(job, signals).await? {
                return self.stop(job, stop_as).await;
            }

            let Some(r) = stream.take() else {
                break;
            };
            let p = parser.clone();
            let (r, read) = self
                .workers
                .run(move || {
                    let mut r = r;
                    let read = r.next_batch().map(|batch| {
                        batch.map(|b| ChunkRead {
                            end: b.end,
                            lines_consumed: b.lines_consumed(),
                            malformed: b.malformed,
                            parsed: p.parse_batch(&b.rows),
                        })
                    });
                    (r, read)
                })
                .await?;
            let Some(chunk) = read.map_err(ImportError::Source)? else {
                break;
            };
            stream = Some(r);

            let checkpoint = ChunkCheckpoint {
                job_id: job.job_id.clone(),
                offset: chunk.end,
                lines_consumed: chunk.lines_consumed,
                parse_skipped: chunk.parsed.skipped,
                malformed: chunk.malformed,
                data_warnings: chunk.parsed.data_warnings,
            };
            let merged = self
                .store
                .merge_chunk(schema, chunk.parsed.records, Some(&checkpoint))
                .await
                .map_err(ImportError::from_storage)?;
            job.apply_chunk(&checkpoint, merged);
            info!(
                target: "fec::import",
                job_id = %job.job_id,
                line = job.line_offset,
                processed = job.records_processed,
                inserted = job.records_inserted,
                updated = job.records_updated,
                skipped = job.records_skipped,
                malformed = job.malformed_lines,
                "chunk committed"
            );
        }

        self.stop(job, JobStatus::Completed).await?;
        if let Some(hash) = &job.source_hash {
            self.store
                .mark_file_imported(job.data_type, job.cycle, hash)
                .await
                .map_err(ImportError::from_storage)?;
        }
        Ok(())
    }

    async fn stop(&self, job: &mut ImportJob, status: JobStatus) -> Result<()> {
        job.transition(status)?;
        self.persist(job).await?;
        info!(
            target: "fec::import",
            job_id = %job.job_id,
            status = %status,
            processed = job.records_processed,
            inserted = job.records_inserted,
            updated = job.records_updated,
            skipped = job.records_skipped,
            malformed = job.malformed_lines,
            data_warnings = job.data_warnings,
            "import job stopped"
        );
        Ok(())
    }

    /// Pending pause/cancel request, from this process or persisted by another.
    async fn requested_stop(&self, job: &ImportJob, signals: &JobSignals) -> Result<Option<JobStatus>> {
        if signals.cancel.load(Ordering::SeqCst) {
            return Ok(Some(JobStatus::Cancelled));
        }
        if signals.pause.load(Ordering::SeqCst) {
            return Ok(Some(JobStatus::Paused));
        }
        let persisted = self
            .store
            .control_request(&job.job_id)
            .await
            .map_err(ImportError::from_storage)?;
        Ok(match persisted {
            JobControl::Cancel => Some(JobStatus::Cancelled),
            JobControl::Pause => Some(JobStatus::Paused),
            JobControl::None => None,
        })
    }

    /// Resolve the file to read, downloading it when needed.
    async fn prepare_source(&self, job: &mut ImportJob, source: &ImportSource) -> Result<Prepared> {
        match source {
            ImportSource::LocalFile(path) => {
                if !path.exists() {
                    return Err(ImportError::Source(anyhow::anyhow!(
                        "source file {} does not exist",
                        path.display()
                    )));
                }
                let hash = self.verify_source(job, path).await?;
                job.file_path = Some(path.clone());
                job.source_hash = Some(hash);
                self.persist(job).await?;
                Ok(Prepared::Ready)
            }
            ImportSource::Download { force } => {
                let bulk = self.source.as_ref().ok_or_else(|| {
                    ImportError::Source(anyhow::anyhow!("no bulk download source configured"))
                })?;
                let store = &self.store;
                if !force {
                    let existing = store
                        .latest_file_metadata(job.data_type, job.cycle)
                        .await
                        .map_err(ImportError::from_storage)?;
                    if let Some(meta) = existing.filter(|m| m.file_path.exists()) {
                        info!(
                            target: "fec::import",
                            job_id = %job.job_id,
                            file = %meta.file_path.display(),
                            "reusing earlier download"
                        );
                        job.file_path = Some(meta.file_path.clone());
                        job.source_hash = Some(meta.content_hash);
                        self.persist(job).await?;
                        return Ok(Prepared::Ready);
                    }
                }

                let meta = bulk
                    .fetch(job.data_type, job.cycle)
                    .await
                    .map_err(ImportError::Source)?;
                let prior = store
                    .find_file_metadata(job.data_type, job.cycle, &meta.content_hash)
                    .await
                    .map_err(ImportError::from_storage)?;
                store
                    .record_file_metadata(&meta)
                    .await
                    .map_err(ImportError::from_storage)?;
                job.file_path = Some(meta.file_path.clone());
                job.source_hash = Some(meta.content_hash.clone());
                self.persist(job).await?;
                if prior.is_some_and(|p| p.imported) {
                    return Ok(Prepared::AlreadyImported);
                }
                Ok(Prepared::Ready)
            }
        }
    }

    /// Hash `path`, refusing it when the job already committed lines read
    /// from content with a different hash.
    async fn verify_source(&self, job: &ImportJob, path: &Path) -> Result<String> {
        let (hash, _) = hash_file(path).await.map_err(ImportError::Source)?;
        match &job.source_hash {
            Some(expected) if *expected != hash && job.line_offset > 0 => {
                Err(ImportError::Source(anyhow::anyhow!(
                    "{} changed since job {} committed line {}; start a new import",
                    path.display(),
                    job.job_id,
                    job.line_offset
                )))
            }
            _ => Ok(hash),
        }
    }

    /// Stage the source, open it at the job's offset and resolve its columns.
    async fn open(
        &self,
        job: &ImportJob,
        path: &Path,
        chunk_size: usize,
    ) -> Result<(ChunkedReader, RecordParser)> {
        let schema = job.data_type.schema();
        let path = path.to_path_buf();
        let staging = self.config.staging_dir.clone();
        let offset = job.offset();
        let cycle = job.cycle;
        self.workers
            .run(move || -> Result<(ChunkedReader, RecordParser)> {
                let staged = stage_source(&path, &staging).map_err(ImportError::Source)?;
                let mut reader = read_chunks(&staged, schema.format, chunk_size, offset)
                    .map_err(ImportError::Source)?;
                let columns = schema.resolve_columns(reader.headers())?;
                reader.set_expected_width(columns.expected_width);
                Ok((reader, RecordParser::new(schema, columns, cycle)))
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::job::BulkFileMetadata;
    use crate::bulk::merge::{MergeCounts, StoredRow};
    use crate::bulk::parser::NormalizedRecord;
    use crate::bulk::schema::RecordSchema;
    use crate::database_ops::MemoryStore;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, Semaphore};

    /// Delegates to a [`MemoryStore`], optionally holding chunk commits at a
    /// gate or failing one of them.
    struct HookedStore {
        inner: Arc<MemoryStore>,
        entered: Option<mpsc::UnboundedSender<usize>>,
        gate: Option<Arc<Semaphore>>,
        fail_on_chunk: Option<usize>,
        chunks: AtomicUsize,
        /// Holds the task right after a terminal status was written.
        stopped: Option<(mpsc::UnboundedSender<JobStatus>, Arc<Semaphore>)>,
    }

    impl HookedStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                entered: None,
                gate: None,
                fail_on_chunk: None,
                chunks: AtomicUsize::new(0),
                stopped: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for HookedStore {
        async fn insert_job(&self, job: &ImportJob) -> anyhow::Result<()> {
            self.inner.insert_job(job).await
        }
        async fn load_job(&self, job_id: &str) -> anyhow::Result<Option<ImportJob>> {
            self.inner.load_job(job_id).await
        }
        async fn list_jobs(&self, limit: usize) -> anyhow::Result<Vec<ImportJob>> {
            self.inner.list_jobs(limit).await
        }
        async fn jobs_in_status(&self, statuses: &[JobStatus]) -> anyhow::Result<Vec<ImportJob>> {
            self.inner.jobs_in_status(statuses).await
        }
        async fn update_job_state(&self, job: &ImportJob) -> anyhow::Result<bool> {
            let changed = self.inner.update_job_state(job).await?;
            if let Some((tx, hold)) = self.stopped.as_ref().filter(|_| job.status.is_terminal()) {
                let _ = tx.send(job.status);
                hold.acquire().await?.forget();
            }
            Ok(changed)
        }
        async fn control_request(&self, job_id: &str) -> anyhow::Result<JobControl> {
            self.inner.control_request(job_id).await
        }
        async fn set_control_request(&self, job_id: &str, c: JobControl) -> anyhow::Result<bool> {
            self.inner.set_control_request(job_id, c).await
        }
        async fn merge_chunk(
            &self,
            schema: &'static RecordSchema,
            records: Vec<NormalizedRecord>,
            checkpoint: Option<&ChunkCheckpoint>,
        ) -> anyhow::Result<MergeCounts> {
            let n = self.chunks.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(tx) = &self.entered {
                let _ = tx.send(n);
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            if self.fail_on_chunk == Some(n) {
                anyhow::bail!("disk full");
            }
            self.inner.merge_chunk(schema, records, checkpoint).await
        }
        async fn find_file_metadata(
            &self,
            dt: DataType,
            cycle: i32,
            hash: &str,
        ) -> anyhow::Result<Option<BulkFileMetadata>> {
            self.inner.find_file_metadata(dt, cycle, hash).await
        }
        async fn latest_file_metadata(
            &self,
            dt: DataType,
            cycle: i32,
        ) -> anyhow::Result<Option<BulkFileMetadata>> {
            self.inner.latest_file_metadata(dt, cycle).await
        }
        async fn record_file_metadata(&self, meta: &BulkFileMetadata) -> anyhow::Result<()> {
            self.inner.record_file_metadata(meta).await
        }
        async fn mark_file_imported(&self, dt: DataType, cycle: i32, hash: &str) -> anyhow::Result<()> {
            self.inner.mark_file_imported(dt, cycle, hash).await
        }
        async fn lookup(&self, dt: DataType, key: &str) -> anyhow::Result<Option<StoredRow>> {
            self.inner.lookup(dt, key).await
        }
    }

    fn committee_line(id: &str, name: &str) -> String {
        let mut cols = vec![id.to_string(), name.to_string()];
        cols.extend((2..15).map(|i| format!("v{i}")));
        cols.join("|") + "\n"
    }

    fn committee_file(dir: &Path, n: usize) -> PathBuf {
        let body: String = (1..=n)
            .map(|i| committee_line(&format!("C{i:08}"), &format!("COMMITTEE {i}")))
            .collect();
        let path = dir.join("cm24.txt");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn config(dir: &Path, max_jobs: usize) -> ImportConfig {
        ImportConfig {
            chunk_size: 2,
            max_concurrent_jobs: max_jobs,
            parse_workers: 2,
            data_dir: dir.to_path_buf(),
            staging_dir: dir.join("staging"),
            ..ImportConfig::default()
        }
    }

    fn request(path: &Path) -> ImportRequest {
        ImportRequest {
            data_type: DataType::CommitteeMaster,
            cycle: 2024,
            source: ImportSource::LocalFile(path.to_path_buf()),
            chunk_size: None,
        }
    }

    fn download_request(force: bool) -> ImportRequest {
        ImportRequest {
            data_type: DataType::CommitteeMaster,
            cycle: 2024,
            source: ImportSource::Download { force },
            chunk_size: None,
        }
    }

    fn zipped(entry: &str, body: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file(entry, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
        writer.finish().unwrap();
        cursor.into_inner()
    }

    /// Minimal HTTP/1.1 server answering every HEAD and GET with `body`.
    struct BulkServer {
        base_url: String,
        body: Arc<Mutex<Vec<u8>>>,
        gets: Arc<AtomicUsize>,
    }

    impl BulkServer {
        async fn start(body: Vec<u8>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let body = Arc::new(Mutex::new(body));
            let gets = Arc::new(AtomicUsize::new(0));
            let (served, counted) = (body.clone(), gets.clone());
            tokio::spawn(async move {
                while let Ok((mut sock, _)) = listener.accept().await {
                    let (served, counted) = (served.clone(), counted.clone());
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match sock.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let payload = served.lock().unwrap().clone();
                        let mut response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            payload.len()
                        )
                        .into_bytes();
                        if request.starts_with(b"GET") {
                            counted.fetch_add(1, Ordering::SeqCst);
                            response.extend_from_slice(&payload);
                        }
                        let _ = sock.write_all(&response).await;
                        let _ = sock.shutdown().await;
                    });
                }
            });
            Self {
                base_url,
                body,
                gets,
            }
        }

        fn source(&self, dir: &Path) -> BulkSource {
            BulkSource::new(self.base_url.clone(), dir, 1 << 20, Duration::from_secs(10)).unwrap()
        }
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 5);
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();

        let first = ctl.start_import(request(&file)).await.unwrap().wait().await.unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!((first.processed, first.inserted), (5, 5));

        let second = ctl.start_import(request(&file)).await.unwrap().wait().await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!((second.inserted, second.updated, second.skipped), (0, 0, 5));
        assert_eq!(store.row_count(DataType::CommitteeMaster), 5);
    }

    #[tokio::test]
    async fn rows_without_a_key_are_skipped_not_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm24.txt");
        let body = [
            committee_line("C00000001", "A"),
            committee_line("  ", "NO KEY"),
            committee_line("C00000003", "C"),
            "C00000004|TOO|FEW\n".to_string(),
        ]
        .concat();
        std::fs::write(&path, body).unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();

        let snap = ctl.start_import(request(&path)).await.unwrap().wait().await.unwrap();
        assert_eq!(snap.processed, 4);
        assert_eq!(snap.inserted, 2);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.malformed, 1);
        assert_eq!(store.row_count(DataType::CommitteeMaster), 2);
        assert!(store
            .lookup(DataType::CommitteeMaster, "C00000003:2024")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn admission_rejects_jobs_over_the_cap_without_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 4);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 1), None).unwrap();

        let running = ctl.start_import(request(&file)).await.unwrap();
        entered.recv().await.unwrap();

        let rejected = ctl.start_import(request(&file)).await;
        assert!(matches!(rejected, Err(ImportError::ResourceLimit(_))));
        assert_eq!(memory.list_jobs(10).await.unwrap().len(), 1);

        gate.add_permits(100);
        let snap = running.wait().await.unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(ctl.active_jobs(), 0);
    }

    #[tokio::test]
    async fn oversized_local_files_are_rejected_at_admission() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 4);
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(dir.path(), 2);
        cfg.max_file_bytes = 10;
        let ctl = ImportController::new(store.clone(), cfg, None).unwrap();
        assert!(matches!(
            ctl.start_import(request(&file)).await,
            Err(ImportError::ResourceLimit(_))
        ));
        assert!(store.list_jobs(10).await.unwrap().is_empty());
        assert_eq!(ctl.active_jobs(), 0);
    }

    #[tokio::test]
    async fn cancellation_takes_effect_at_the_next_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 10);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let job_id = handle.job_id.clone();
        assert_eq!(entered.recv().await, Some(1));
        gate.add_permits(1);
        assert_eq!(entered.recv().await, Some(2));
        // Chunk 2 is in flight: it must still commit in full.
        assert!(ctl.cancel_job(&job_id).await.unwrap());
        gate.add_permits(1);

        let snap = handle.wait().await.unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_eq!(snap.processed, 4);
        assert_eq!(snap.inserted, 4);
        assert_eq!(memory.row_count(DataType::CommitteeMaster), 4);
        assert!(!ctl.cancel_job(&job_id).await.unwrap());
        assert!(!ctl.cancel_job("no-such-job").await.unwrap());
    }

    #[tokio::test]
    async fn paused_jobs_resume_under_the_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 7);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let job_id = handle.job_id.clone();
        entered.recv().await.unwrap();
        assert!(ctl.pause_job(&job_id).await.unwrap());
        gate.add_permits(1);
        let paused = handle.wait().await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.processed, 2);

        gate.add_permits(100);
        let done = ctl.resume_job(&job_id).await.unwrap().wait().await.unwrap();
        assert_eq!(done.job_id, job_id);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.processed, done.inserted), (7, 7));
    }

    #[tokio::test]
    async fn retry_after_failure_resumes_from_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 9);
        let memory = Arc::new(MemoryStore::new());
        let mut hooked = HookedStore::new(memory.clone());
        hooked.fail_on_chunk = Some(3);
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let failed_id = handle.job_id.clone();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ImportError::Storage(_)));

        let failed = ctl.get_job(&failed_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.processed, 4);
        assert_eq!(failed.offset.line, 4);
        assert!(failed.error.unwrap().contains("disk full"));
        assert_eq!(memory.row_count(DataType::CommitteeMaster), 4);

        let retried = ctl.retry_job(&failed_id).await.unwrap().wait().await.unwrap();
        assert_eq!(retried.status, JobStatus::Completed);
        assert_eq!((retried.processed, retried.inserted, retried.skipped), (9, 9, 0));
        let row = memory.load_job(&retried.job_id).await.unwrap().unwrap();
        assert_eq!(row.resumed_from.as_deref(), Some(failed_id.as_str()));
        // The failed job's offset stays frozen.
        assert_eq!(ctl.get_job(&failed_id).await.unwrap().offset.line, 4);
    }

    #[tokio::test]
    async fn interrupted_jobs_recover_and_finish_with_identical_totals() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 10);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(2));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let crashed = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = crashed.start_import(request(&file)).await.unwrap();
        let job_id = handle.job_id.clone();
        for expected in 1..=3 {
            assert_eq!(entered.recv().await, Some(expected));
        }
        // Chunk 3 never commits: the process dies while it waits at the gate.
        handle.abort();
        let _ = handle.wait().await;
        assert_eq!(memory.load_job(&job_id).await.unwrap().unwrap().status, JobStatus::Running);

        let restarted = ImportController::new(memory.clone(), config(dir.path(), 2), None).unwrap();
        assert_eq!(restarted.recover_interrupted().await.unwrap(), vec![job_id.clone()]);
        let paused = restarted.get_job(&job_id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.offset.line, 4);

        let done = restarted.resume_job(&job_id).await.unwrap().wait().await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.processed, done.inserted, done.updated, done.skipped), (10, 10, 0, 0));
        assert_eq!(memory.row_count(DataType::CommitteeMaster), 10);
    }

    #[tokio::test]
    async fn unresolvable_headers_fail_before_any_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("independent_expenditure_2024.csv");
        std::fs::write(&path, "cand_id,exp_amo\nP00000001,100\n").unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();

        let handle = ctl
            .start_import(ImportRequest {
                data_type: DataType::IndependentExpenditures,
                cycle: 2024,
                source: ImportSource::LocalFile(path),
                chunk_size: None,
            })
            .await
            .unwrap();
        let job_id = handle.job_id.clone();
        let err = handle.wait().await.unwrap_err();
        match err {
            ImportError::SchemaResolution(e) => {
                let missing: Vec<&str> = e.missing.iter().map(|m| m.field).collect();
                assert!(missing.contains(&"committee_id"));
                assert!(missing.contains(&"transaction_id"));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
        let snap = ctl.get_job(&job_id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.processed, 0);
        assert!(snap.error.unwrap().contains("committee_id"));
    }

    #[tokio::test]
    async fn control_operations_respect_job_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 2);
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();
        let done = ctl.start_import(request(&file)).await.unwrap().wait().await.unwrap();

        assert!(!ctl.pause_job(&done.job_id).await.unwrap());
        assert!(matches!(
            ctl.resume_job(&done.job_id).await,
            Err(ImportError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ctl.retry_job(&done.job_id).await,
            Err(ImportError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ctl.get_job("missing").await,
            Err(ImportError::JobNotFound(_))
        ));
        assert_eq!(ctl.list_jobs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_source_file_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();
        let handle = ctl
            .start_import(request(&dir.path().join("absent.txt")))
            .await
            .unwrap();
        let job_id = handle.job_id.clone();
        assert!(matches!(handle.wait().await, Err(ImportError::Source(_))));
        assert_eq!(ctl.get_job(&job_id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn local_imports_record_the_source_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 3);
        let (hash, _) = hash_file(&file).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(store.clone(), config(dir.path(), 2), None).unwrap();
        let done = ctl.start_import(request(&file)).await.unwrap().wait().await.unwrap();
        let row = store.load_job(&done.job_id).await.unwrap().unwrap();
        assert_eq!(row.source_hash, Some(hash));
    }

    #[tokio::test]
    async fn retry_refuses_a_source_file_changed_after_the_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 6);
        let original = std::fs::read(&file).unwrap();
        let memory = Arc::new(MemoryStore::new());
        let mut hooked = HookedStore::new(memory.clone());
        hooked.fail_on_chunk = Some(2);
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let failed_id = handle.job_id.clone();
        assert!(handle.wait().await.is_err());
        assert_eq!(ctl.get_job(&failed_id).await.unwrap().offset.line, 2);

        // Same name, different rows: line 2 no longer marks the same place.
        let replaced: String = (1..=8)
            .map(|i| committee_line(&format!("D{i:08}"), "REPLACED"))
            .collect();
        std::fs::write(&file, replaced).unwrap();
        assert!(matches!(
            ctl.retry_job(&failed_id).await,
            Err(ImportError::Source(_))
        ));
        assert_eq!(memory.list_jobs(10).await.unwrap().len(), 1);
        assert_eq!(ctl.active_jobs(), 0);

        std::fs::write(&file, original).unwrap();
        let retried = ctl.retry_job(&failed_id).await.unwrap().wait().await.unwrap();
        assert_eq!(retried.status, JobStatus::Completed);
        assert_eq!((retried.processed, retried.inserted), (6, 6));
        assert!(memory
            .lookup(DataType::CommitteeMaster, "D00000001:2024")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resume_refuses_a_changed_file_and_paused_jobs_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 6);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let job_id = handle.job_id.clone();
        entered.recv().await.unwrap();
        assert!(ctl.pause_job(&job_id).await.unwrap());
        gate.add_permits(1);
        assert_eq!(handle.wait().await.unwrap().status, JobStatus::Paused);

        let mut appended = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        appended
            .write_all(committee_line("C00000099", "LATE").as_bytes())
            .unwrap();
        drop(appended);
        assert!(matches!(
            ctl.resume_job(&job_id).await,
            Err(ImportError::Source(_))
        ));
        assert_eq!(ctl.get_job(&job_id).await.unwrap().status, JobStatus::Paused);
        assert_eq!(ctl.active_jobs(), 0);

        assert!(ctl.cancel_job(&job_id).await.unwrap());
        let cancelled = ctl.get_job(&job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.processed, 2);
        assert!(!ctl.cancel_job(&job_id).await.unwrap());
        assert!(matches!(
            ctl.resume_job(&job_id).await,
            Err(ImportError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn control_requests_on_a_stopping_job_report_the_stored_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = committee_file(dir.path(), 2);
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut stopped) = mpsc::unbounded_channel();
        let hold = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.stopped = Some((tx, hold.clone()));
        let ctl = ImportController::new(Arc::new(hooked), config(dir.path(), 2), None).unwrap();

        let handle = ctl.start_import(request(&file)).await.unwrap();
        let job_id = handle.job_id.clone();
        assert_eq!(stopped.recv().await, Some(JobStatus::Completed));
        // Still admitted in this process, but its row is already terminal.
        assert_eq!(ctl.active_jobs(), 1);
        assert!(!ctl.cancel_job(&job_id).await.unwrap());
        assert!(!ctl.pause_job(&job_id).await.unwrap());

        hold.add_permits(1);
        assert_eq!(handle.wait().await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn downloads_are_marked_imported_and_not_imported_twice() {
        let dir = tempfile::tempdir().unwrap();
        let rows: String = (1..=3)
            .map(|i| committee_line(&format!("C{i:08}"), &format!("COMMITTEE {i}")))
            .collect();
        let server = BulkServer::start(zipped("cm24.txt", &rows)).await;
        let memory = Arc::new(MemoryStore::new());
        let ctl = ImportController::new(
            memory.clone(),
            config(dir.path(), 2),
            Some(server.source(dir.path())),
        )
        .unwrap();

        let first = ctl.start_import(download_request(true)).await.unwrap().wait().await.unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!((first.processed, first.inserted), (3, 3));
        let meta = memory
            .latest_file_metadata(DataType::CommitteeMaster, 2024)
            .await
            .unwrap()
            .unwrap();
        assert!(meta.imported);
        assert!(meta
            .file_path
            .starts_with(dir.path().join("2024").join(&meta.content_hash[..16])));
        let row = memory.load_job(&first.job_id).await.unwrap().unwrap();
        assert_eq!(row.source_hash.as_deref(), Some(meta.content_hash.as_str()));

        // Forced again with identical content: downloaded, then nothing to do.
        let again = ctl.start_import(download_request(true)).await.unwrap().wait().await.unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!((again.processed, again.inserted), (0, 0));
        assert_eq!(server.gets.load(Ordering::SeqCst), 2);

        // Unforced imports reuse the file on disk without another request.
        let reused = ctl.start_import(download_request(false)).await.unwrap().wait().await.unwrap();
        assert_eq!(reused.status, JobStatus::Completed);
        assert_eq!((reused.processed, reused.inserted, reused.skipped), (3, 0, 3));
        assert_eq!(server.gets.load(Ordering::SeqCst), 2);
        let row = memory.load_job(&reused.job_id).await.unwrap().unwrap();
        assert_eq!(row.file_path.as_deref(), Some(meta.file_path.as_path()));
        assert_eq!(memory.row_count(DataType::CommitteeMaster), 3);
    }

    #[tokio::test]
    async fn newer_downloads_leave_a_paused_jobs_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let older: String = (1..=4)
            .map(|i| committee_line(&format!("C{i:08}"), "OLDER"))
            .collect();
        let server = BulkServer::start(zipped("cm24.txt", &older)).await;
        let memory = Arc::new(MemoryStore::new());
        let (tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let mut hooked = HookedStore::new(memory.clone());
        hooked.entered = Some(tx);
        hooked.gate = Some(gate.clone());
        let gated = ImportController::new(
            Arc::new(hooked),
            config(dir.path(), 2),
            Some(server.source(dir.path())),
        )
        .unwrap();

        let handle = gated.start_import(download_request(true)).await.unwrap();
        let paused_id = handle.job_id.clone();
        entered.recv().await.unwrap();
        assert!(gated.pause_job(&paused_id).await.unwrap());
        gate.add_permits(1);
        assert_eq!(handle.wait().await.unwrap().status, JobStatus::Paused);
        let older_path = memory
            .load_job(&paused_id)
            .await
            .unwrap()
            .unwrap()
            .file_path
            .unwrap();
        let older_bytes = std::fs::read(&older_path).unwrap();

        let newer: String = (1..=4)
            .map(|i| committee_line(&format!("D{i:08}"), "NEWER"))
            .collect();
        *server.body.lock().unwrap() = zipped("cm24.txt", &newer);
        let ctl = ImportController::new(
            memory.clone(),
            config(dir.path(), 2),
            Some(server.source(dir.path())),
        )
        .unwrap();
        let latest = ctl.start_import(download_request(true)).await.unwrap().wait().await.unwrap();
        assert_eq!((latest.status, latest.inserted), (JobStatus::Completed, 4));
        let newer_path = memory
            .load_job(&latest.job_id)
            .await
            .unwrap()
            .unwrap()
            .file_path
            .unwrap();
        assert_ne!(newer_path, older_path);
        assert_eq!(std::fs::read(&older_path).unwrap(), older_bytes);

        let resumed = ctl.resume_job(&paused_id).await.unwrap().wait().await.unwrap();
        assert_eq!(resumed.status, JobStatus::Completed);
        assert_eq!((resumed.processed, resumed.inserted), (4, 4));
        assert_eq!(memory.row_count(DataType::CommitteeMaster), 8);
    }
}
