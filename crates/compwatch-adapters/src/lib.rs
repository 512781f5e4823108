//! Competition source contracts + the WCA API and fixture-file implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use compwatch_core::{Competition, CountryCode, WatchError};
use compwatch_storage::HttpFetcher;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "compwatch-adapters";

pub const WCA_COMPETITIONS_URL: &str = "https://www.worldcubeassociation.org/api/v0/competitions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub country: CountryCode,
    pub now: DateTime<Utc>,
}

/// Anything that can list the competitions currently announced for a country.
///
/// Implementations return the whole list they know about; deciding what is new is
/// left to the caller.
#[async_trait]
pub trait CompetitionSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_competitions(&self, ctx: &SourceContext) -> Result<Vec<Competition>, WatchError>;
}

/// Decode an API payload (a JSON array of competition objects).
pub fn parse_competitions(origin: &str, body: &[u8]) -> Result<Vec<Competition>, WatchError> {
    serde_json::from_slice(body).map_err(|err| WatchError::MalformedResponse {
        url: origin.to_string(),
        reason: err.to_string(),
    })
}

pub fn competitions_url(base_url: &str, country: &CountryCode, announced_after: Option<NaiveDate>) -> String {
    let mut url = format!("{base_url}?country_iso2={country}");
    if let Some(date) = announced_after {
        url.push_str(&format!("&announced_after={}", date.format("%Y-%m-%d")));
    }
    url
}

/// Live source backed by the WCA competitions endpoint.
#[derive(Debug, Clone)]
pub struct WcaApiSource {
    http: HttpFetcher,
    base_url: String,
    search_range: Option<Duration>,
}

impl WcaApiSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            search_range: None,
        }
    }

    /// Only ask for competitions announced within `range` of the run time.
    ///
    /// A range reaching past the earliest representable date sends no lower bound.
    pub fn with_search_range(mut self, range: Duration) -> Self {
        self.search_range = Some(range);
        self
    }

    pub fn request_url(&self, ctx: &SourceContext) -> String {
        let announced_after = self
            .search_range
            .and_then(|range| ctx.now.checked_sub_signed(range))
            .map(|since| since.date_naive());
        competitions_url(&self.base_url, &ctx.country, announced_after)
    }
}

#[async_trait]
impl CompetitionSource for WcaApiSource {
    fn source_id(&self) -> &'static str {
        "wca-api"
    }

    async fn fetch_competitions(&self, ctx: &SourceContext) -> Result<Vec<Competition>, WatchError> {
        let url = self.request_url(ctx);
        let resp = self.http.fetch_bytes(ctx.run_id, &url).await?;
        let competitions = parse_competitions(&url, &resp.body)?;
        info!(%url, count = competitions.len(), "fetched competitions");
        Ok(competitions)
    }
}

/// Offline source reading a saved API payload from disk.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CompetitionSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_competitions(&self, ctx: &SourceContext) -> Result<Vec<Competition>, WatchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| WatchError::file_access(&self.path, err))?;
        let competitions = parse_competitions(&self.path.display().to_string(), &bytes)?;
        info!(
            path = %self.path.display(),
            country = %ctx.country,
            count = competitions.len(),
            "loaded fixture competitions"
        );
        Ok(competitions)
    }
}
