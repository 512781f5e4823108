//! Persisted run state (seen IDs, summary report) + HTTP fetch utilities for compwatch.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use compwatch_core::{Competition, WatchError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "compwatch-storage";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Reads a UTF-8 file, mapping "not found" to `None`.
async fn read_optional(path: &Path) -> Result<Option<String>, WatchError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(WatchError::file_access(path, err)),
    }
}

/// Replace `path` with `bytes` through a sibling temp file and a rename, so a crash
/// mid-write never leaves a truncated file behind.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), WatchError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| WatchError::file_access(&parent, err))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "compwatch".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(WatchError::file_access(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(WatchError::file_access(path, err));
    }
    Ok(())
}

/// Line-delimited set of competition IDs that have already been reported.
///
/// The set only ever grows; nothing expires.
#[derive(Debug, Clone)]
pub struct SeenIdStore {
    path: PathBuf,
}

impl SeenIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is the first-run condition and yields an empty set.
    pub async fn load(&self) -> Result<BTreeSet<String>, WatchError> {
        let ids = read_optional(&self.path)
            .await?
            .map(|text| parse_seen_ids(&text))
            .unwrap_or_default();
        debug!(path = %self.path.display(), count = ids.len(), "loaded seen ids");
        Ok(ids)
    }

    pub async fn save(&self, ids: &BTreeSet<String>) -> Result<(), WatchError> {
        write_atomically(&self.path, format_seen_ids(ids).as_bytes()).await?;
        debug!(path = %self.path.display(), count = ids.len(), "saved seen ids");
        Ok(())
    }
}

pub fn parse_seen_ids(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn format_seen_ids(ids: &BTreeSet<String>) -> String {
    ids.iter().fold(String::new(), |mut out, id| {
        out.push_str(id);
        out.push('\n');
        out
    })
}

/// Human-readable "as of" stamp used in the summary header.
pub fn format_as_of(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Header line stamped with `now`.
pub fn header_line(marker: &str, now: DateTime<Utc>) -> String {
    format!("{marker} as of {}", format_as_of(now))
}

/// Whether `previous` already carries a header starting with `marker`.
pub fn has_header(previous: &str, marker: &str) -> bool {
    previous.split('\n').any(|line| line.starts_with(marker))
}

/// Full summary document: header, blank line, then one block per competition
/// ordered by announcement time.
pub fn render_summary(header: &str, competitions: &[Competition]) -> String {
    let mut ordered: Vec<&Competition> = competitions.iter().collect();
    ordered.sort_by(|a, b| a.announced_at.cmp(&b.announced_at));

    let body = ordered
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{header}\n\n{body}\n")
}

/// The text report listing competitions found by the latest run.
#[derive(Debug, Clone)]
pub struct SummaryFile {
    path: PathBuf,
    marker: String,
}

impl SummaryFile {
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            marker: marker.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Rewrite the report for `competitions`, returning the text that was written.
    ///
    /// Any body the previous file carried is dropped; only the header is refreshed.
    pub async fn rewrite(
        &self,
        competitions: &[Competition],
        now: DateTime<Utc>,
    ) -> Result<String, WatchError> {
        let previous = read_optional(&self.path).await?.unwrap_or_default();
        let had_header = has_header(&previous, &self.marker);
        let text = render_summary(&header_line(&self.marker, now), competitions);
        write_atomically(&self.path, text.as_bytes()).await?;
        debug!(
            path = %self.path.display(),
            entries = competitions.len(),
            had_header,
            "summary rewritten"
        );
        Ok(text)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

/// Single-attempt HTTP GET client. There is no retry or backoff: the first failure is final.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, WatchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let as_unreachable = |err: reqwest::Error| WatchError::RemoteUnreachable {
                url: url.to_string(),
                reason: err.to_string(),
            };

            let resp = self.client.get(url).send().await.map_err(as_unreachable)?;
            let status = resp.status();
            let resp_url = resp.url().clone();
            if !status.is_success() {
                return Err(WatchError::RemoteRequest {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = resp.bytes().await.map_err(as_unreachable)?.to_vec();
            debug!(
                status = status.as_u16(),
                final_url = %resp_url,
                bytes = body.len(),
                "fetched"
            );
            Ok::<_, WatchError>(FetchedResponse { body })
        }
        .instrument(span)
        .await
    }
}
