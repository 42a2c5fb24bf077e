//! Bounded-memory streaming over FEC flat files.
//!
//! Batches hold at most `chunk_size` source lines. The offset recorded after
//! each batch (line count + byte position of the next record) lets a later run
//! seek straight past everything already committed.
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ByteRecord, Position, ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::download::hex_digest;
use super::schema::SourceFormat;

const READ_BUFFER_BYTES: usize = 8 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOffset {
    /// Source lines consumed (header excluded).
    pub line: u64,
    /// Byte position where the next unread record starts.
    pub byte: u64,
}

#[derive(Debug)]
pub struct RowBatch {
    /// Well-formed rows with their 1-based data line numbers.
    pub rows: Vec<(u64, StringRecord)>,
    pub malformed: u64,
    pub start: ReadOffset,
    pub end: ReadOffset,
}

impl RowBatch {
    pub fn lines_consumed(&self) -> u64 {
        self.end.line - self.start.line
    }
}

pub struct ChunkedReader {
    inner: csv::Reader<BufReader<File>>,
    headers: Option<Vec<String>>,
    expected_width: Option<usize>,
    chunk_size: usize,
    offset: ReadOffset,
    record: ByteRecord,
    done: bool,
}

impl std::fmt::Debug for ChunkedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("chunk_size", &self.chunk_size)
            .field("offset", &self.offset)
            .field("expected_width", &self.expected_width)
            .field("done", &self.done)
            .finish()
    }
}

/// Open `path` for chunked reading, resuming after `resume` when non-zero.
pub fn read_chunks(
    path: &Path,
    format: SourceFormat,
    chunk_size: usize,
    resume: ReadOffset,
) -> Result<ChunkedReader> {
    ChunkedReader::open(path, format, chunk_size, resume)
}

impl ChunkedReader {
    pub fn open(
        path: &Path,
        format: SourceFormat,
        chunk_size: usize,
        resume: ReadOffset,
    ) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut inner = ReaderBuilder::new()
            .has_headers(format.has_headers())
            .delimiter(format.delimiter())
            // FEC pipe files contain stray unbalanced quotes inside names.
            .quoting(matches!(format, SourceFormat::HeadedCsv))
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(BufReader::with_capacity(READ_BUFFER_BYTES, file));

        let headers = if format.has_headers() {
            let raw = inner
                .byte_headers()
                .with_context(|| format!("read header row of {}", path.display()))?;
            Some(
                raw.iter()
                    .map(|h| String::from_utf8_lossy(h).into_owned())
                    .collect(),
            )
        } else {
            None
        };

        if resume.byte > 0 {
            let mut pos = Position::new();
            pos.set_byte(resume.byte)
                .set_line(resume.line + 1)
                .set_record(resume.line);
            inner
                .seek(pos)
                .with_context(|| format!("seek {} to byte {}", path.display(), resume.byte))?;
            debug!(
                target: "fec::reader",
                path = %path.display(),
                line = resume.line,
                byte = resume.byte,
                "resumed reader"
            );
        }

        Ok(Self {
            inner,
            headers,
            expected_width: None,
            chunk_size: chunk_size.max(1),
            offset: resume,
            record: ByteRecord::new(),
            done: false,
        })
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// Lines whose column count differs from `width` are reported as malformed.
    pub fn set_expected_width(&mut self, width: Option<usize>) {
        self.expected_width = width;
    }

    pub fn offset(&self) -> ReadOffset {
        self.offset
    }

    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }
        let start = self.offset;
        let mut rows = Vec::with_capacity(self.chunk_size.min(65_536));
        let mut malformed = 0u64;
        let mut consumed = 0usize;

        while consumed < self.chunk_size {
            if !self.inner.read_byte_record(&mut self.record)? {
                self.done = true;
                break;
            }
            consumed += 1;
            self.offset.line += 1;
            self.offset.byte = self.inner.position().byte();
            let line = self.offset.line;

            if let Some(width) = self.expected_width {
                if self.record.len() != width {
                    malformed += 1;
                    warn!(
                        target: "fec::reader",
                        line,
                        columns = self.record.len(),
                        expected = width,
                        "skipping line with wrong column count"
                    );
                    continue;
                }
            }
            match StringRecord::from_byte_record(self.record.clone()) {
                Ok(rec) => rows.push((line, rec)),
                Err(err) => {
                    malformed += 1;
                    warn!(target: "fec::reader", line, error = %err, "skipping line with invalid UTF-8");
                }
            }
        }

        if consumed == 0 {
            return Ok(None);
        }
        Ok(Some(RowBatch {
            rows,
            malformed,
            start,
            end: self.offset,
        }))
    }
}

impl Iterator for ChunkedReader {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

// ---------------------------------------------------------------------------
// Zip staging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StagingMarker {
    archive: String,
    archive_size: u64,
    archive_modified_secs: u64,
    entry: String,
}

fn is_zip(path: &Path) -> Result<bool> {
    if path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
    {
        return Ok(true);
    }
    let mut magic = [0u8; 4];
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match f.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == b"PK\x03\x04"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Return a path to the plain data file behind `source`.
///
/// Zip archives are extracted once into `staging_dir`: the largest `.txt` or
/// `.csv` entry is written next to a marker recording the archive size and
/// mtime, so later calls reuse it without decompressing again. Each archive
/// path gets its own directory, so same-named archives never share one.
pub fn stage_source(source: &Path, staging_dir: &Path) -> Result<PathBuf> {
    if !is_zip(source)? {
        return Ok(source.to_path_buf());
    }
    let meta = fs::metadata(source).with_context(|| format!("stat {}", source.display()))?;
    let modified_secs = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("archive");
    let path_digest =
        hex_digest(Sha256::digest(source.display().to_string().as_bytes()).as_slice());
    let stage_dir = staging_dir.join(format!("{stem}-{}", &path_digest[..12]));
    let marker_path = stage_dir.join(".staged.json");

    if let Ok(raw) = fs::read(&marker_path) {
        if let Ok(marker) = serde_json::from_slice::<StagingMarker>(&raw) {
            let staged = stage_dir.join(&marker.entry);
            if marker.archive == source.display().to_string()
                && marker.archive_size == meta.len()
                && marker.archive_modified_secs == modified_secs
                && staged.exists()
            {
                debug!(target: "fec::reader", staged = %staged.display(), "reusing staged archive entry");
                return Ok(staged);
            }
        }
    }

    let file = File::open(source).with_context(|| format!("open {}", source.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("read zip directory of {}", source.display()))?;

    let mut best: Option<(usize, u64, String)> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let lower = name.to_ascii_lowercase();
        if entry.is_dir() || !(lower.ends_with(".txt") || lower.ends_with(".csv")) {
            continue;
        }
        if best.as_ref().map_or(true, |(_, size, _)| entry.size() > *size) {
            best = Some((i, entry.size(), name));
        }
    }
    let (index, size, name) = best
        .with_context(|| format!("{} contains no .txt/.csv entry", source.display()))?;
    let file_name = Path::new(&name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data.txt")
        .to_string();

    fs::create_dir_all(&stage_dir)
        .with_context(|| format!("create staging dir {}", stage_dir.display()))?;
    let staged = stage_dir.join(&file_name);
    let partial = stage_dir.join(format!("{file_name}.partial"));
    info!(
        target: "fec::reader",
        archive = %source.display(),
        entry = %name,
        bytes = size,
        "extracting archive entry"
    );
    {
        let mut entry = archive.by_index(index)?;
        let mut out = io::BufWriter::with_capacity(
            READ_BUFFER_BYTES,
            File::create(&partial).with_context(|| format!("create {}", partial.display()))?,
        );
        io::copy(&mut entry, &mut out).with_context(|| format!("extract {name}"))?;
        io::Write::flush(&mut out)?;
    }
    fs::rename(&partial, &staged)?;

    let marker = StagingMarker {
        archive: source.display().to_string(),
        archive_size: meta.len(),
        archive_modified_secs: modified_secs,
        entry: file_name,
    };
    fs::write(&marker_path, serde_json::to_vec_pretty(&marker)?)?;
    Ok(staged)
}
