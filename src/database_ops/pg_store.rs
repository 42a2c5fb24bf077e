//! PostgreSQL [`Store`]: array-bound batch writes and per-chunk transactions.
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use super::{checkpoint_rejected, Store};
use crate::bulk::job::{BulkFileMetadata, ChunkCheckpoint, ImportJob, JobControl, JobStatus};
use crate::bulk::merge::{plan_merge, MergeCounts, StoredRow};
use crate::bulk::parser::NormalizedRecord;
use crate::bulk::schema::{DataType, RecordSchema};
use crate::util::db::Db;

const JOB_COLUMNS: &str = "job_id, data_type, cycle, status, file_path, source_hash, \
    line_offset, byte_offset, records_processed, records_inserted, records_updated, \
    records_skipped, malformed_lines, data_warnings, error_message, resumed_from, control, \
    created_at, updated_at";

const FILE_COLUMNS: &str =
    "data_type, cycle, downloaded_at, file_path, file_size, content_hash, imported";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn as_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn as_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn job_from_row(row: &PgRow) -> Result<ImportJob> {
    let data_type: String = row.try_get("data_type")?;
    let status: String = row.try_get("status")?;
    let control: String = row.try_get("control")?;
    Ok(ImportJob {
        job_id: row.try_get("job_id")?,
        data_type: data_type.parse()?,
        cycle: row.try_get("cycle")?,
        status: status.parse()?,
        file_path: row
            .try_get::<Option<String>, _>("file_path")?
            .map(PathBuf::from),
        source_hash: row.try_get("source_hash")?,
        line_offset: as_u64(row.try_get("line_offset")?),
        byte_offset: as_u64(row.try_get("byte_offset")?),
        records_processed: as_u64(row.try_get("records_processed")?),
        records_inserted: as_u64(row.try_get("records_inserted")?),
        records_updated: as_u64(row.try_get("records_updated")?),
        records_skipped: as_u64(row.try_get("records_skipped")?),
        malformed_lines: as_u64(row.try_get("malformed_lines")?),
        data_warnings: as_u64(row.try_get("data_warnings")?),
        error_message: row.try_get("error_message")?,
        resumed_from: row.try_get("resumed_from")?,
        control: control.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn file_from_row(row: &PgRow) -> Result<BulkFileMetadata> {
    let data_type: String = row.try_get("data_type")?;
    Ok(BulkFileMetadata {
        data_type: data_type.parse()?,
        cycle: row.try_get("cycle")?,
        downloaded_at: row.try_get("downloaded_at")?,
        file_path: PathBuf::from(row.try_get::<String, _>("file_path")?),
        file_size: as_u64(row.try_get("file_size")?),
        content_hash: row.try_get("content_hash")?,
        imported: row.try_get("imported")?,
    })
}

/// Column arrays for an UNNEST-bound batch write.
#[derive(Default)]
struct RowArrays {
    keys: Vec<String>,
    cycles: Vec<i32>,
    committee_ids: Vec<Option<String>>,
    candidate_ids: Vec<Option<String>>,
    dates: Vec<Option<NaiveDate>>,
    amounts: Vec<Option<f64>>,
    fields: Vec<serde_json::Value>,
}

impl RowArrays {
    fn collect<'a>(schema: &RecordSchema, rows: impl Iterator<Item = &'a StoredRow>) -> Self {
        let mut out = RowArrays::default();
        for row in rows {
            out.keys.push(row.natural_key.clone());
            out.cycles.push(row.cycle);
            out.committee_ids.push(row.index_text(schema.index.committee_id));
            out.candidate_ids.push(row.index_text(schema.index.candidate_id));
            out.dates.push(row.index_date(schema.index.date));
            out.amounts.push(row.index_amount(schema.index.amount));
            out.fields.push(row.fields_json());
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

async fn advance_checkpoint(
    tx: &mut Transaction<'_, Postgres>,
    cp: &ChunkCheckpoint,
    counts: MergeCounts,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE fec_import_jobs SET
            line_offset = $2,
            byte_offset = $3,
            records_processed = records_processed + $4,
            records_inserted = records_inserted + $5,
            records_updated = records_updated + $6,
            records_skipped = records_skipped + $7,
            malformed_lines = malformed_lines + $8,
            data_warnings = data_warnings + $9,
            updated_at = now()
         WHERE job_id = $1 AND status = 'running' AND line_offset <= $2",
    )
    .persistent(false)
    .bind(&cp.job_id)
    .bind(as_i64(cp.offset.line))
    .bind(as_i64(cp.offset.byte))
    .bind(as_i64(cp.lines_consumed))
    .bind(as_i64(counts.inserted))
    .bind(as_i64(counts.updated))
    .bind(as_i64(counts.skipped + cp.parse_skipped))
    .bind(as_i64(cp.malformed))
    .bind(as_i64(cp.data_warnings))
    .execute(&mut **tx)
    .await
    .context("advance job checkpoint")?;
    if res.rows_affected() == 0 {
        return Err(checkpoint_rejected(cp));
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for PgStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn insert_job(&self, job: &ImportJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO fec_import_jobs ({JOB_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        ))
        .persistent(false)
        .bind(&job.job_id)
        .bind(job.data_type.as_str())
        .bind(job.cycle)
        .bind(job.status.as_str())
        .bind(job.file_path.as_ref().map(|p| p.display().to_string()))
        .bind(&job.source_hash)
        .bind(as_i64(job.line_offset))
        .bind(as_i64(job.byte_offset))
        .bind(as_i64(job.records_processed))
        .bind(as_i64(job.records_inserted))
        .bind(as_i64(job.records_updated))
        .bind(as_i64(job.records_skipped))
        .bind(as_i64(job.malformed_lines))
        .bind(as_i64(job.data_warnings))
        .bind(&job.error_message)
        .bind(&job.resumed_from)
        .bind(job.control.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.db.pool)
        .await
        .context("insert import job")?;
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<ImportJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fec_import_jobs WHERE job_id = $1"
        ))
        .persistent(false)
        .bind(job_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("load import job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<ImportJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fec_import_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .persistent(false)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db.pool)
        .await
        .context("list import jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_in_status(&self, statuses: &[JobStatus]) -> Result<Vec<ImportJob>> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fec_import_jobs WHERE status = ANY($1) ORDER BY created_at"
        ))
        .persistent(false)
        .bind(&wanted)
        .fetch_all(&self.db.pool)
        .await
        .context("select jobs by status")?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, status = %job.status))]
    async fn update_job_state(&self, job: &ImportJob) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE fec_import_jobs SET
                status = $2, file_path = $3, source_hash = $4, error_message = $5,
                control = CASE WHEN $2 IN ('paused', 'completed', 'failed', 'cancelled')
                    THEN 'none' ELSE control END,
                updated_at = now()
             WHERE job_id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .persistent(false)
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(job.file_path.as_ref().map(|p| p.display().to_string()))
        .bind(&job.source_hash)
        .bind(&job.error_message)
        .execute(&self.db.pool)
        .await
        .context("update import job state")?;
        Ok(res.rows_affected() > 0)
    }

    async fn control_request(&self, job_id: &str) -> Result<JobControl> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT control FROM fec_import_jobs WHERE job_id = $1")
                .persistent(false)
                .bind(job_id)
                .fetch_optional(&self.db.pool)
                .await
                .context("read job control request")?;
        raw.map_or(Ok(JobControl::None), |s| s.parse())
    }

    async fn set_control_request(&self, job_id: &str, control: JobControl) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE fec_import_jobs SET control = $2, updated_at = now()
             WHERE job_id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .persistent(false)
        .bind(job_id)
        .bind(control.as_str())
        .execute(&self.db.pool)
        .await
        .context("set job control request")?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(
        skip(self, schema, records, checkpoint),
        fields(
            data_type = %schema.data_type,
            records = records.len(),
            job_id = checkpoint.map(|c| c.job_id.as_str()).unwrap_or("-")
        )
    )]
    async fn merge_chunk(
        &self,
        schema: &'static RecordSchema,
        records: Vec<NormalizedRecord>,
        checkpoint: Option<&ChunkCheckpoint>,
    ) -> Result<MergeCounts> {
        let table = schema.data_type.table();
        let mut tx = self.db.pool.begin().await.context("begin chunk transaction")?;

        let mut keys: Vec<String> = records.iter().map(|r| r.natural_key.clone()).collect();
        keys.sort_unstable();
        keys.dedup();

        let mut existing: HashMap<String, StoredRow> = HashMap::with_capacity(keys.len());
        if !keys.is_empty() {
            let rows = sqlx::query(&format!(
                "SELECT natural_key, cycle, fields FROM {table}
                 WHERE natural_key = ANY($1) FOR UPDATE"
            ))
            .persistent(false)
            .bind(&keys)
            .fetch_all(&mut *tx)
            .await
            .with_context(|| format!("lock existing rows in {table}"))?;
            for row in rows {
                let key: String = row.try_get("natural_key")?;
                let cycle: i32 = row.try_get("cycle")?;
                let fields: serde_json::Value = row.try_get("fields")?;
                existing.insert(key.clone(), StoredRow::from_json(schema, key, cycle, &fields));
            }
        }

        let plan = plan_merge(schema, &existing, records);
        let mut counts = plan.counts;

        let inserts = RowArrays::collect(schema, plan.inserts());
        if !inserts.is_empty() {
            let res = sqlx::query(&format!(
                "INSERT INTO {table}
                    (natural_key, cycle, committee_id, candidate_id, record_date, amount, fields)
                 SELECT * FROM UNNEST(
                    $1::text[], $2::int4[], $3::text[], $4::text[], $5::date[], $6::float8[], $7::jsonb[]
                 )
                 ON CONFLICT (natural_key) DO NOTHING"
            ))
            .persistent(false)
            .bind(&inserts.keys)
            .bind(&inserts.cycles)
            .bind(&inserts.committee_ids)
            .bind(&inserts.candidate_ids)
            .bind(&inserts.dates)
            .bind(&inserts.amounts)
            .bind(&inserts.fields)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert into {table}"))?;
            // A concurrent writer can claim a key between the lock and the insert.
            let lost = (inserts.keys.len() as u64).saturating_sub(res.rows_affected());
            if lost > 0 {
                warn!(target: "fec::store", table, lost, "insert conflicts counted as skipped");
                counts.inserted -= lost;
                counts.skipped += lost;
            }
        }

        let updates = RowArrays::collect(schema, plan.updates());
        if !updates.is_empty() {
            sqlx::query(&format!(
                "UPDATE {table} AS t SET
                    committee_id = u.committee_id,
                    candidate_id = u.candidate_id,
                    record_date = u.record_date,
                    amount = u.amount,
                    fields = u.fields,
                    updated_at = now()
                 FROM UNNEST($1::text[], $2::text[], $3::text[], $4::date[], $5::float8[], $6::jsonb[])
                    AS u(natural_key, committee_id, candidate_id, record_date, amount, fields)
                 WHERE t.natural_key = u.natural_key"
            ))
            .persistent(false)
            .bind(&updates.keys)
            .bind(&updates.committee_ids)
            .bind(&updates.candidate_ids)
            .bind(&updates.dates)
            .bind(&updates.amounts)
            .bind(&updates.fields)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update {table}"))?;
        }

        if let Some(cp) = checkpoint {
            advance_checkpoint(&mut tx, cp, counts).await?;
        }
        tx.commit().await.context("commit chunk transaction")?;
        debug!(
            target: "fec::store",
            table,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            "chunk committed"
        );
        Ok(counts)
    }

    async fn find_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<Option<BulkFileMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM fec_bulk_files
             WHERE data_type = $1 AND cycle = $2 AND content_hash = $3"
        ))
        .persistent(false)
        .bind(data_type.as_str())
        .bind(cycle)
        .bind(content_hash)
        .fetch_optional(&self.db.pool)
        .await
        .context("find bulk file metadata")?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn latest_file_metadata(
        &self,
        data_type: DataType,
        cycle: i32,
    ) -> Result<Option<BulkFileMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM fec_bulk_files
             WHERE data_type = $1 AND cycle = $2
             ORDER BY downloaded_at DESC LIMIT 1"
        ))
        .persistent(false)
        .bind(data_type.as_str())
        .bind(cycle)
        .fetch_optional(&self.db.pool)
        .await
        .context("latest bulk file metadata")?;
        row.as_ref().map(file_from_row).transpose()
    }

    #[instrument(skip(self, meta), fields(data_type = %meta.data_type, cycle = meta.cycle))]
    async fn record_file_metadata(&self, meta: &BulkFileMetadata) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO fec_bulk_files ({FILE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (data_type, cycle, content_hash) DO UPDATE SET
                downloaded_at = EXCLUDED.downloaded_at,
                file_path = EXCLUDED.file_path,
                file_size = EXCLUDED.file_size"
        ))
        .persistent(false)
        .bind(meta.data_type.as_str())
        .bind(meta.cycle)
        .bind(meta.downloaded_at)
        .bind(meta.file_path.display().to_string())
        .bind(as_i64(meta.file_size))
        .bind(&meta.content_hash)
        .bind(meta.imported)
        .execute(&self.db.pool)
        .await
        .context("record bulk file metadata")?;
        Ok(())
    }

    async fn mark_file_imported(
        &self,
        data_type: DataType,
        cycle: i32,
        content_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE fec_bulk_files SET imported = true
             WHERE data_type = $1 AND cycle = $2 AND content_hash = $3",
        )
        .persistent(false)
        .bind(data_type.as_str())
        .bind(cycle)
        .bind(content_hash)
        .execute(&self.db.pool)
        .await
        .context("mark bulk file imported")?;
        Ok(())
    }

    async fn lookup(&self, data_type: DataType, natural_key: &str) -> Result<Option<StoredRow>> {
        let table = data_type.table();
        let row = sqlx::query(&format!(
            "SELECT natural_key, cycle, fields FROM {table} WHERE natural_key = $1"
        ))
        .persistent(false)
        .bind(natural_key)
        .fetch_optional(&self.db.pool)
        .await
        .with_context(|| format!("lookup in {table}"))?;
        row.map(|row| -> Result<StoredRow> {
            let key: String = row.try_get("natural_key")?;
            let fields: serde_json::Value = row.try_get("fields")?;
            Ok(StoredRow::from_json(
                data_type.schema(),
                key,
                row.try_get("cycle")?,
                &fields,
            ))
        })
        .transpose()
    }
}
