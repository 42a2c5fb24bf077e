//! In-process [`Store`] used by `--dry-run` imports and the test suite.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::Utc;

use super::{checkpoint_rejected, Store};
use crate::bulk::job::{BulkFileMetadata, ChunkCheckpoint, ImportJob, JobControl, JobStatus};
use crate::bulk::merge::{plan_merge, MergeAction, MergeCounts, StoredRow};
use crate::bulk::parser::NormalizedRecord;
use crate::bulk::schema::{DataType, RecordSchema};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, ImportJob>,
    tables: HashMap<DataType, HashMap<String, StoredRow>>,
    files: Vec<BulkFileMetadata>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    pub fn row_count(&self, data_type: DataType) -> usize {
        self.lock()
            .map(|g| g.tables.get(&data_type).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<()> {
        let mut g = self.lock()?;
        if g.jobs.contains_key(&job.job_id) {
            return Err(anyhow!("job {} already exists", job.job_id));
        }
        g.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<ImportJob>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<ImportJob>> {
        let g = self.lock()?;
        let mut jobs: Vec<ImportJob> = g.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn jobs_in_status(&self, statuses: &[JobStatus]) -> Result<Vec<ImportJob>> {
        let g = self.lock()?;
        let mut jobs: Vec<ImportJob> = g
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn update_job_state(&self, job: &ImportJob) -> Result<bool> {
        let mut g = self.lock()?;
        let Some(row) = g.jobs.get_mut(&job.job_id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = job.status;
        row.file_path = job.file_path.clone();
        row.source_hash = job.source_hash.clone();
        row.error_message = job.error_message.clone();
        if job.status == JobStatus::Paused || job.status.is_terminal() {
            row.control = JobControl::None;
        }
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn control_request(&self, job_id: &str) -> Result<JobControl> {
        Ok(self
            .lock()?
            .jobs
            .get(job_id)
            .map_or(JobControl::None, |j| j.control))
    }

    async fn set_control_request(&self, job_id: &str, control: JobControl) -> Result<bool> {
        let mut g = self.lock()?;
        match g.jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.control = control;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn merge_chunk(
        &self,
        schema: &'static RecordSchema,
        records: Vec<NormalizedRecord>,
        checkpoint: Option<&ChunkCheckpoint>,
    ) -> Result<MergeCounts> {
        let mut g = self.lock()?;

        if let Some(cp) = checkpoint {
            let ok = g.jobs.get(&cp.job_id).is_some_and(|job| {
                job.status == JobStatus::Running && job.line_offset <= cp.offset.line
            });
            if !ok {
                return Err(checkpoint_rejected(cp));
            }
        }

        let table = g.tables.entry(schema.data_type).or_default();
        let existing: HashMap<String, StoredRow> = records
            .iter()
            .filter_map(|r| {
                table
                    .get(&r.natural_key)
                    .map(|row| (r.natural_key.clone(), row.clone()))
            })
            .collect();
        let plan = plan_merge(schema, &existing, records);
        for action in plan.actions {
            let row = match action {
                MergeAction::Insert(row) | MergeAction::Update { row, .. } => row,
            };
            table.insert(row.natural_key.clone(), row);
        }

        if let Some(cp) = checkpoint {
            if let Some(job) = g.jobs.get_mut(&cp.job_id) {
                job.apply_chunk(cp, plan.counts);
            }
        }
        Ok(plan.counts)
    }

    async fn find_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<Option<BulkFileMetadata>> {
        Ok(self
            .lock()?
            .files
            .iter()
            .find(|f| f.data_type == data_type && f.cycle == cycle && f.content_hash == content_hash)
            .cloned())
    }

    async fn latest_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
    ) -> Result<Option<BulkFileMetadata>> {
        Ok(self
            .lock()?
            .files
            .iter()
            .filter(|f| f.data_type == data_type && f.cycle == cycle)
            .max_by_key(|f| f.downloaded_at)
            .cloned())
    }

    async fn record_file_metadata(&self, meta: &BulkFileMetadata) -> Result<()> {
        let mut g = self.lock()?;
        match g.files.iter_mut().find(|f| {
            f.data_type == meta.data_type
                && f.cycle == meta.cycle
                && f.content_hash == meta.content_hash
        }) {
            Some(existing) => {
                existing.downloaded_at = meta.downloaded_at;
                existing.file_path = meta.file_path.clone();
                existing.file_size = meta.file_size;
            }
            None => g.files.push(meta.clone()),
        }
        Ok(())
    }

    async fn mark_file_imported(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<()> {
        let mut g = self.lock()?;
        for f in g.files.iter_mut().filter(|f| {
            f.data_type == data_type && f.cycle == cycle && f.content_hash == content_hash
        }) {
            f.imported = true;
        }
        Ok(())
    }

    async fn lookup(&self, data_type: DataType, natural_key: &str) -> Result<Option<StoredRow>> {
        Ok(self
            .lock()?
            .tables
            .get(&data_type)
            .and_then(|t| t.get(natural_key))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::merge::merge_batch;
    use crate::bulk::parser::FieldValue;
    use crate::bulk::reader::ReadOffset;
    use std::collections::BTreeMap;

    fn committee(id: &str, name: &str) -> NormalizedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("committee_id".to_string(), FieldValue::Text(id.into()));
        fields.insert("committee_name".to_string(), FieldValue::Text(name.into()));
        NormalizedRecord {
            natural_key: format!("{id}:2024"),
            cycle: 2024,
            fields,
        }
    }

    fn checkpoint(job: &ImportJob, line: u64) -> ChunkCheckpoint {
        ChunkCheckpoint {
            job_id: job.job_id.clone(),
            offset: ReadOffset { line, byte: line * 10 },
            lines_consumed: 1,
            parse_skipped: 0,
            malformed: 0,
            data_warnings: 0,
        }
    }

    #[tokio::test]
    async fn checkpoint_requires_running_job() {
        let store = MemoryStore::new();
        let schema = DataType::CommitteeMaster.schema();
        let mut job = ImportJob::new(DataType::CommitteeMaster, 2024);
        store.insert_job(&job).await.unwrap();

        let cp = checkpoint(&job, 1);
        let err = store
            .merge_chunk(schema, vec![committee("C00000001", "A")], Some(&cp))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert_eq!(store.row_count(DataType::CommitteeMaster), 0);

        job.transition(JobStatus::Running).unwrap();
        store.update_job_state(&job).await.unwrap();
        let counts = store
            .merge_chunk(schema, vec![committee("C00000001", "A")], Some(&cp))
            .await
            .unwrap();
        assert_eq!(counts.inserted, 1);
        let stored = store.load_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.line_offset, 1);
        assert_eq!(stored.records_processed, 1);
    }

    #[tokio::test]
    async fn offsets_never_move_backwards() {
        let store = MemoryStore::new();
        let schema = DataType::CommitteeMaster.schema();
        let mut job = ImportJob::new(DataType::CommitteeMaster, 2024);
        job.transition(JobStatus::Running).unwrap();
        store.insert_job(&job).await.unwrap();

        store
            .merge_chunk(schema, vec![], Some(&checkpoint(&job, 5)))
            .await
            .unwrap();
        assert!(store
            .merge_chunk(schema, vec![], Some(&checkpoint(&job, 3)))
            .await
            .is_err());
        assert_eq!(store.load_job(&job.job_id).await.unwrap().unwrap().line_offset, 5);
    }

    #[tokio::test]
    async fn terminal_jobs_are_frozen() {
        let store = MemoryStore::new();
        let mut job = ImportJob::new(DataType::CandidateMaster, 2024);
        job.transition(JobStatus::Cancelled).unwrap();
        store.insert_job(&job).await.unwrap();

        job.error_message = Some("late write".into());
        assert!(!store.update_job_state(&job).await.unwrap());
        assert!(!store
            .set_control_request(&job.job_id, JobControl::Cancel)
            .await
            .unwrap());
        let stored = store.load_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn one_shot_merge_needs_no_job() {
        let store = MemoryStore::new();
        let schema = DataType::CommitteeMaster.schema();
        let counts = merge_batch(
            &store,
            schema,
            vec![committee("C00000001", "A"), committee("C00000002", "B")],
        )
        .await
        .unwrap();
        assert_eq!(counts.inserted, 2);

        let counts = merge_batch(&store, schema, vec![committee("C00000001", "A RENAMED")])
            .await
            .unwrap();
        assert_eq!((counts.inserted, counts.updated), (0, 1));
        let row = store
            .lookup(DataType::CommitteeMaster, "C00000001:2024")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("committee_name").as_text(), Some("A RENAMED"));
    }

    #[tokio::test]
    async fn file_metadata_upsert_keeps_imported_flag() {
        let store = MemoryStore::new();
        let mut meta = BulkFileMetadata {
            data_type: DataType::CommitteeMaster,
            cycle: 2024,
            downloaded_at: Utc::now(),
            file_path: "/data/cm24.zip".into(),
            file_size: 10,
            content_hash: "abc".into(),
            imported: false,
        };
        store.record_file_metadata(&meta).await.unwrap();
        store
            .mark_file_imported(DataType::CommitteeMaster, 2024, "abc")
            .await
            .unwrap();
        meta.file_size = 11;
        store.record_file_metadata(&meta).await.unwrap();
        let found = store
            .find_file_metadata(DataType::CommitteeMaster, 2024, "abc")
            .await
            .unwrap()
            .unwrap();
        assert!(found.imported);
        assert_eq!(found.file_size, 11);
    }
}
