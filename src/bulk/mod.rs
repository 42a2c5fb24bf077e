//! FEC bulk file import: layouts, chunked reading, parsing, merging and jobs.
pub mod controller;
pub mod download;
pub mod job;
pub mod merge;
pub mod parser;
pub mod reader;
pub mod schema;

pub use controller::{ImportController, ImportHandle, ImportRequest, ImportSource};
pub use job::{ImportJob, JobControl, JobSnapshot, JobStatus};
pub use schema::DataType;
