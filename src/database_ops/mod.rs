//! Persistence for import jobs, bulk file bookkeeping and the FEC domain tables.
pub mod memory_store;
pub mod pg_store;

use anyhow::Result;

use crate::bulk::job::{BulkFileMetadata, ChunkCheckpoint, ImportJob, JobControl, JobStatus};
use crate::bulk::merge::{MergeCounts, StoredRow};
use crate::bulk::parser::NormalizedRecord;
use crate::bulk::schema::{DataType, RecordSchema};

pub use memory_store::MemoryStore;
pub use pg_store::PgStore;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, job: &ImportJob) -> Result<()>;

    async fn load_job(&self, job_id: &str) -> Result<Option<ImportJob>>;

    /// Most recent first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<ImportJob>>;

    async fn jobs_in_status(&self, statuses: &[JobStatus]) -> Result<Vec<ImportJob>>;

    /// Persist status, source file and error.
    ///
    /// Offsets and counters only move through [`Store::merge_chunk`]; a pending
    /// control request is cleared once the job pauses or ends. Rows that are
    /// already terminal are left untouched; returns whether a row changed.
    async fn update_job_state(&self, job: &ImportJob) -> Result<bool>;

    async fn control_request(&self, job_id: &str) -> Result<JobControl>;

    /// Record a pause/cancel request for a non-terminal job. Returns false when
    /// the job is unknown or already terminal.
    async fn set_control_request(&self, job_id: &str, control: JobControl) -> Result<bool>;

    /// Merge one chunk and, when a checkpoint is given, advance the job's
    /// offset and counters in the same transaction.
    ///
    /// The checkpoint only applies to a `running` job whose committed offset
    /// does not exceed the new one; otherwise nothing is written and an error
    /// is returned.
    async fn merge_chunk(
        &self,
        schema: &'static RecordSchema,
        records: Vec<NormalizedRecord>,
        checkpoint: Option<&ChunkCheckpoint>,
    ) -> Result<MergeCounts>;

    async fn find_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<Option<BulkFileMetadata>>;

    /// Latest download recorded for a data type and cycle.
    async fn latest_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
    ) -> Result<Option<BulkFileMetadata>>;

    /// Upsert by `(data_type, cycle, content_hash)`; an existing `imported`
    /// flag is preserved.
    async fn record_file_metadata(&self, meta: &BulkFileMetadata) -> Result<()>;

    async fn mark_file_imported(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<()>;

    async fn lookup(&self, data_type: DataType, natural_key: &str) -> Result<Option<StoredRow>>;
}

pub(crate) fn checkpoint_rejected(checkpoint: &ChunkCheckpoint) -> anyhow::Error {
    anyhow::anyhow!(
        "checkpoint for job {} at line {} rejected: job is not running or its offset is already past it",
        checkpoint.job_id,
        checkpoint.offset.line
    )
}
