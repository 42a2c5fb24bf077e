//! FEC bulk-download site access: URL layout, HEAD probes and hashed downloads.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, instrument};

use super::job::BulkFileMetadata;
use super::schema::DataType;
use crate::config::ImportConfig;

/// What the server reports about a bulk file before downloading it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BulkSource {
    http: reqwest::Client,
    base_url: String,
    data_dir: PathBuf,
    max_file_bytes: u64,
}

impl BulkSource {
    pub fn new(
        base_url: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        max_file_bytes: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("fec-bulk/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            data_dir: data_dir.into(),
            max_file_bytes,
        })
    }

    pub fn from_config(cfg: &ImportConfig) -> Result<Self> {
        Self::new(
            cfg.bulk_base_url.clone(),
            cfg.data_dir.clone(),
            cfg.max_file_bytes,
            cfg.http_timeout,
        )
    }

    /// `{base}/{cycle}/{file}`
    pub fn url_for(&self, data_type: DataType, cycle: i32) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            cycle,
            data_type.bulk_file_name(cycle)
        )
    }

    /// Where a download with the given content hash is stored.
    ///
    /// Each distinct content gets its own directory, so a newer download never
    /// replaces a file an unfinished job is still reading.
    pub fn local_path(&self, data_type: DataType, cycle: i32, content_hash: &str) -> PathBuf {
        let prefix = content_hash.get(..16).unwrap_or(content_hash);
        self.data_dir
            .join(cycle.to_string())
            .join(prefix)
            .join(data_type.bulk_file_name(cycle))
    }

    #[instrument(skip(self))]
    pub async fn probe(&self, data_type: DataType, cycle: i32) -> Result<RemoteFileInfo> {
        let url = self.url_for(data_type, cycle);
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD {url}"))?
            .error_for_status()
            .with_context(|| format!("HEAD {url}"))?;
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(RemoteFileInfo { content_length })
    }

    /// Stream the bulk file to disk, hashing as it arrives.
    ///
    /// The body goes to a uniquely named `.part` file that is moved to
    /// [`local_path`](Self::local_path) only after the whole response was
    /// received within the size limit.
    #[instrument(skip(self))]
    pub async fn fetch(&self, data_type: DataType, cycle: i32) -> Result<BulkFileMetadata> {
        let url = self.url_for(data_type, cycle);
        let cycle_dir = self.data_dir.join(cycle.to_string());
        tokio::fs::create_dir_all(&cycle_dir)
            .await
            .with_context(|| format!("create {}", cycle_dir.display()))?;
        let partial = cycle_dir.join(format!(
            "{}.{}.part",
            data_type.bulk_file_name(cycle),
            uuid::Uuid::new_v4()
        ));

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        if let Some(len) = resp.content_length() {
            if len > self.max_file_bytes {
                bail!(
                    "{url} is {len} bytes, above the {} byte limit",
                    self.max_file_bytes
                );
            }
        }

        let mut out = tokio::io::BufWriter::new(
            tokio::fs::File::create(&partial)
                .await
                .with_context(|| format!("create {}", partial.display()))?,
        );
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("read body of {url}"))?;
            written += chunk.len() as u64;
            if written > self.max_file_bytes {
                drop(out);
                let _ = tokio::fs::remove_file(&partial).await;
                bail!("{url} exceeded the {} byte limit", self.max_file_bytes);
            }
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);

        let content_hash = hex_digest(hasher.finalize().as_slice());
        let dest = self.local_path(data_type, cycle, &content_hash);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::rename(&partial, &dest)
            .await
            .with_context(|| format!("move download into {}", dest.display()))?;
        info!(
            target: "fec::download",
            %url,
            bytes = written,
            sha256 = %content_hash,
            "bulk file downloaded"
        );
        Ok(BulkFileMetadata {
            data_type,
            cycle,
            downloaded_at: Utc::now(),
            file_path: dest,
            file_size: written,
            content_hash,
            imported: false,
        })
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// SHA-256 of a local file, streamed.
pub async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex_digest(hasher.finalize().as_slice()), total))
}
