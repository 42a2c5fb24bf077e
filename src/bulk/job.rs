use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::merge::MergeCounts;
use super::reader::ReadOffset;
use super::schema::DataType;
use crate::error::{ImportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Failed | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => anyhow::bail!("unknown job status '{other}'"),
        })
    }
}

/// Cooperative request persisted on the job row, honoured at chunk boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobControl {
    #[default]
    None,
    Pause,
    Cancel,
}

impl JobControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobControl::None => "none",
            JobControl::Pause => "pause",
            JobControl::Cancel => "cancel",
        }
    }
}

impl FromStr for JobControl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "" | "none" => JobControl::None,
            "pause" => JobControl::Pause,
            "cancel" => JobControl::Cancel,
            other => anyhow::bail!("unknown job control request '{other}'"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: String,
    pub data_type: DataType,
    pub cycle: i32,
    pub status: JobStatus,
    pub file_path: Option<PathBuf>,
    pub source_hash: Option<String>,
    pub line_offset: u64,
    pub byte_offset: u64,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub malformed_lines: u64,
    pub data_warnings: u64,
    pub error_message: Option<String>,
    pub resumed_from: Option<String>,
    pub control: JobControl,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(data_type: DataType, cycle: i32) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            data_type,
            cycle,
            status: JobStatus::Pending,
            file_path: None,
            source_hash: None,
            line_offset: 0,
            byte_offset: 0,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_skipped: 0,
            malformed_lines: 0,
            data_warnings: 0,
            error_message: None,
            resumed_from: None,
            control: JobControl::None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh job continuing where `prior` stopped: same file, offset and counters.
    pub fn continuation_of(prior: &ImportJob) -> Self {
        let mut job = ImportJob::new(prior.data_type, prior.cycle);
        job.file_path = prior.file_path.clone();
        job.source_hash = prior.source_hash.clone();
        job.line_offset = prior.line_offset;
        job.byte_offset = prior.byte_offset;
        job.records_processed = prior.records_processed;
        job.records_inserted = prior.records_inserted;
        job.records_updated = prior.records_updated;
        job.records_skipped = prior.records_skipped;
        job.malformed_lines = prior.malformed_lines;
        job.data_warnings = prior.data_warnings;
        job.resumed_from = Some(prior.job_id.clone());
        job
    }

    pub fn offset(&self) -> ReadOffset {
        ReadOffset {
            line: self.line_offset,
            byte: self.byte_offset,
        }
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(ImportError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() || to == JobStatus::Paused {
            self.control = JobControl::None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold a committed chunk into the in-memory counters.
    pub fn apply_chunk(&mut self, checkpoint: &ChunkCheckpoint, merged: MergeCounts) {
        self.line_offset = checkpoint.offset.line;
        self.byte_offset = checkpoint.offset.byte;
        self.records_processed += checkpoint.lines_consumed;
        self.records_inserted += merged.inserted;
        self.records_updated += merged.updated;
        self.records_skipped += merged.skipped + checkpoint.parse_skipped;
        self.malformed_lines += checkpoint.malformed;
        self.data_warnings += checkpoint.data_warnings;
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            data_type: self.data_type,
            cycle: self.cycle,
            status: self.status,
            processed: self.records_processed,
            inserted: self.records_inserted,
            updated: self.records_updated,
            skipped: self.records_skipped,
            malformed: self.malformed_lines,
            data_warnings: self.data_warnings,
            offset: self.offset(),
            error: self.error_message.clone(),
        }
    }
}

/// Progress committed together with one chunk's writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCheckpoint {
    pub job_id: String,
    /// Offset after the last line of the chunk.
    pub offset: ReadOffset,
    pub lines_consumed: u64,
    /// Rows the parser rejected (missing natural key).
    pub parse_skipped: u64,
    pub malformed: u64,
    pub data_warnings: u64,
}

/// Operator-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub data_type: DataType,
    pub cycle: i32,
    pub status: JobStatus,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub data_warnings: u64,
    pub offset: ReadOffset,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFileMetadata {
    pub data_type: DataType,
    pub cycle: i32,
    pub downloaded_at: DateTime<Utc>,
    pub file_path: PathBuf,
    pub file_size: u64,
    /// SHA-256, lowercase hex.
    pub content_hash: String,
    pub imported: bool,
}
