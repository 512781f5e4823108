//! Watch run orchestration: configuration, new-competition filtering and the run pipeline.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use compwatch_adapters::{CompetitionSource, FixtureSource, SourceContext, WcaApiSource, WCA_COMPETITIONS_URL};
use compwatch_core::{Clock, Competition, CountryCode, SystemClock, WatchError};
use compwatch_notify::{DesktopNotifier, Notifier, DEFAULT_NOTIFY_COMMAND};
use compwatch_storage::{HttpClientConfig, HttpFetcher, SeenIdStore, SummaryFile};
use serde::Deserialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "compwatch-sync";

pub const DEFAULT_COUNTRY: &str = "CA";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SEARCH_RANGE_DAYS: u32 = 7;
pub const SUMMARY_FILE_NAME: &str = "wca.txt";
pub const SEEN_IDS_FILE_NAME: &str = ".wca_seen_ids";
pub const ICON_FILE_NAME: &str = "wca-logo.png";

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub country: CountryCode,
    pub api_base_url: String,
    pub summary_path: PathBuf,
    pub seen_ids_path: PathBuf,
    /// Prefix identifying the summary header; derived from the country when unset.
    pub header_marker: Option<String>,
    pub icon_path: PathBuf,
    pub notify_command: String,
    pub http_timeout_secs: u64,
    /// 0 asks the API for every competition in the country.
    pub search_range_days: u32,
    pub user_agent: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data = dirs::data_dir().unwrap_or_else(|| home.join(".local").join("share"));
        Self {
            country: DEFAULT_COUNTRY.parse().expect("default country code is valid"),
            api_base_url: WCA_COMPETITIONS_URL.to_string(),
            summary_path: home.join(SUMMARY_FILE_NAME),
            seen_ids_path: home.join(SEEN_IDS_FILE_NAME),
            header_marker: None,
            icon_path: data.join("compwatch").join(ICON_FILE_NAME),
            notify_command: DEFAULT_NOTIFY_COMMAND.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            search_range_days: DEFAULT_SEARCH_RANGE_DAYS,
            user_agent: format!("compwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl WatchConfig {
    /// Defaults, then the optional YAML file, then `COMPWATCH_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = config_file {
            config = config.with_overrides(ConfigOverrides::from_yaml_file(path)?);
        }
        let env = ConfigOverrides::from_lookup(|key| std::env::var(key).ok())?;
        Ok(config.with_overrides(env))
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        let ConfigOverrides {
            country,
            api_base_url,
            summary_path,
            seen_ids_path,
            header_marker,
            icon_path,
            notify_command,
            http_timeout_secs,
            search_range_days,
            user_agent,
        } = overrides;
        if let Some(v) = country {
            self.country = v;
        }
        if let Some(v) = api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = summary_path {
            self.summary_path = v;
        }
        if let Some(v) = seen_ids_path {
            self.seen_ids_path = v;
        }
        if header_marker.is_some() {
            self.header_marker = header_marker;
        }
        if let Some(v) = icon_path {
            self.icon_path = v;
        }
        if let Some(v) = notify_command {
            self.notify_command = v;
        }
        if let Some(v) = http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = search_range_days {
            self.search_range_days = v;
        }
        if let Some(v) = user_agent {
            self.user_agent = v;
        }
        self
    }

    pub fn header_marker(&self) -> String {
        self.header_marker
            .clone()
            .unwrap_or_else(|| format!("Upcoming WCA competitions in {}", self.country))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn search_range(&self) -> Option<chrono::Duration> {
        (self.search_range_days > 0).then(|| chrono::Duration::days(i64::from(self.search_range_days)))
    }
}

/// Partial configuration, as read from a YAML file or the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub country: Option<CountryCode>,
    pub api_base_url: Option<String>,
    pub summary_path: Option<PathBuf>,
    pub seen_ids_path: Option<PathBuf>,
    pub header_marker: Option<String>,
    pub icon_path: Option<PathBuf>,
    pub notify_command: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub search_range_days: Option<u32>,
    pub user_agent: Option<String>,
}

impl ConfigOverrides {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let country = lookup("COMPWATCH_COUNTRY")
            .map(|v| v.parse::<CountryCode>())
            .transpose()
            .context("parsing COMPWATCH_COUNTRY")?;
        let http_timeout_secs = lookup("COMPWATCH_HTTP_TIMEOUT_SECS")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .context("parsing COMPWATCH_HTTP_TIMEOUT_SECS")?;
        let search_range_days = lookup("COMPWATCH_SEARCH_RANGE_DAYS")
            .map(|v| v.trim().parse::<u32>())
            .transpose()
            .context("parsing COMPWATCH_SEARCH_RANGE_DAYS")?;

        Ok(Self {
            country,
            api_base_url: lookup("COMPWATCH_API_URL"),
            summary_path: lookup("COMPWATCH_SUMMARY_PATH").map(PathBuf::from),
            seen_ids_path: lookup("COMPWATCH_SEEN_PATH").map(PathBuf::from),
            header_marker: lookup("COMPWATCH_HEADER_MARKER"),
            icon_path: lookup("COMPWATCH_ICON_PATH").map(PathBuf::from),
            notify_command: lookup("COMPWATCH_NOTIFY_COMMAND"),
            http_timeout_secs,
            search_range_days,
            user_agent: lookup("COMPWATCH_USER_AGENT"),
        })
    }
}

/// Competitions worth reporting: registration still open (or unknown) and never seen before.
///
/// A competition listed twice in one fetch is reported once.
pub fn filter_new_competitions(
    fetched: &[Competition],
    seen: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Vec<Competition> {
    let mut emitted = HashSet::new();
    fetched
        .iter()
        .filter(|c| !c.is_registration_closed(now))
        .filter(|c| !seen.contains(&c.id))
        .filter(|c| emitted.insert(c.id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Only the summary header was refreshed.
    NoNewCompetitions,
    /// Summary rewritten, notification sent, seen IDs extended.
    NewCompetitions(usize),
}

#[derive(Debug, Clone)]
pub struct WatchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: &'static str,
    pub fetched: usize,
    pub new_ids: Vec<String>,
    pub summary_path: PathBuf,
    pub outcome: RunOutcome,
}

pub struct WatchPipeline {
    config: WatchConfig,
    source: Box<dyn CompetitionSource>,
    seen: SeenIdStore,
    summary: SummaryFile,
    notifier: Box<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl WatchPipeline {
    /// Live wiring: WCA API source, desktop notifier, system clock.
    pub fn new(config: WatchConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let mut source = WcaApiSource::new(http, config.api_base_url.clone());
        if let Some(range) = config.search_range() {
            source = source.with_search_range(range);
        }
        let notifier = DesktopNotifier::new(
            config.notify_command.clone(),
            config.icon_path.clone(),
            config.country.clone(),
        );
        Ok(Self {
            seen: SeenIdStore::new(config.seen_ids_path.clone()),
            summary: SummaryFile::new(config.summary_path.clone(), config.header_marker()),
            source: Box::new(source),
            notifier: Box::new(notifier),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    pub fn with_source(mut self, source: Box<dyn CompetitionSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// One full check. Any error aborts the run; nothing is retried.
    pub async fn run_once(&self) -> Result<WatchRunSummary, WatchError> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let span = info_span!(
            "watch_run",
            %run_id,
            country = %self.config.country,
            source = self.source.source_id()
        );

        async {
            let seen = self.seen.load().await?;
            let ctx = SourceContext {
                run_id,
                country: self.config.country.clone(),
                now: started_at,
            };
            let fetched = self.source.fetch_competitions(&ctx).await?;
            let fresh = filter_new_competitions(&fetched, &seen, started_at);

            self.summary.rewrite(&fresh, started_at).await?;

            let outcome = if fresh.is_empty() {
                info!(fetched = fetched.len(), "no new competitions");
                RunOutcome::NoNewCompetitions
            } else {
                // Alert before persisting so a failed alert leaves the IDs unseen for the next run.
                self.notifier.notify(fresh.len()).await?;
                let mut updated = seen;
                updated.extend(fresh.iter().map(|c| c.id.clone()));
                self.seen.save(&updated).await?;
                info!(fetched = fetched.len(), new = fresh.len(), "new competitions announced");
                RunOutcome::NewCompetitions(fresh.len())
            };

            Ok::<_, WatchError>(WatchRunSummary {
                run_id,
                started_at,
                finished_at: self.clock.now(),
                source_id: self.source.source_id(),
                fetched: fetched.len(),
                new_ids: fresh.into_iter().map(|c| c.id).collect(),
                summary_path: self.summary.path().to_path_buf(),
                outcome,
            })
        }
        .instrument(span)
        .await
    }
}

/// Build the live pipeline for `config` (optionally reading a saved payload) and run it once.
pub async fn run_check_once(config: WatchConfig, fixture: Option<PathBuf>) -> Result<WatchRunSummary> {
    let mut pipeline = WatchPipeline::new(config)?;
    if let Some(path) = fixture {
        pipeline = pipeline.with_source(Box::new(FixtureSource::new(path)));
    }
    Ok(pipeline.run_once().await?)
}

pub async fn load_seen_ids(config: &WatchConfig) -> Result<BTreeSet<String>, WatchError> {
    SeenIdStore::new(config.seen_ids_path.clone()).load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 12, 15, 0, 0).single().unwrap()
    }

    fn comp(id: &str, close: Option<&str>) -> Competition {
        Competition {
            id: id.to_string(),
            name: id.to_string(),
            website: format!("https://www.worldcubeassociation.org/competitions/{id}"),
            city: "Montreal, Quebec".to_string(),
            announced_at: "2025-01-01T00:00:00.000Z".to_string(),
            registration_open: None,
            registration_close: close.map(str::to_string),
            start_date: "2025-03-01".to_string(),
            end_date: "2025-03-01".to_string(),
        }
    }

    fn seen(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Vec<Competition> {
        vec![
            comp("Open2025", Some("2025-02-01T00:00:00.000Z")),
            comp("Closed2024", Some("2024-12-01T00:00:00.000Z")),
            comp("Unknown2025", None),
            comp("Drifted2025", Some("01/02/2025")),
            comp("Seen2025", Some("2025-03-01T00:00:00.000Z")),
            comp("ClosesNow2025", Some("2025-01-12T15:00:00.000Z")),
        ]
    }

    #[test]
    fn filter_never_returns_seen_ids() {
        let seen_ids = seen(&["Seen2025", "Unknown2025"]);
        let out = filter_new_competitions(&sample(), &seen_ids, now());
        assert!(out.iter().all(|c| !seen_ids.contains(&c.id)));
    }

    #[test]
    fn filter_keeps_only_open_or_unparseable_deadlines() {
        let out = filter_new_competitions(&sample(), &BTreeSet::new(), now());
        for c in &out {
            if let Some(close) = c.registration_close_at() {
                assert!(close > now(), "{} is closed", c.id);
            }
        }
        let ids: Vec<_> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["Open2025", "Unknown2025", "Drifted2025", "Seen2025"]);
    }

    #[test]
    fn filter_reports_duplicate_listing_once() {
        let fetched = vec![comp("Twice2025", None), comp("Twice2025", None)];
        assert_eq!(filter_new_competitions(&fetched, &BTreeSet::new(), now()).len(), 1);
    }

    #[test]
    fn default_config_points_into_home() {
        let config = WatchConfig::default();
        assert_eq!(config.country.as_str(), "CA");
        assert_eq!(config.api_base_url, WCA_COMPETITIONS_URL);
        assert!(config.summary_path.ends_with(SUMMARY_FILE_NAME));
        assert!(config.seen_ids_path.ends_with(SEEN_IDS_FILE_NAME));
        assert_eq!(config.http_timeout(), Duration::from_secs(60));
        assert_eq!(config.header_marker(), "Upcoming WCA competitions in CA");
        assert_eq!(config.search_range(), Some(chrono::Duration::days(7)));
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("COMPWATCH_COUNTRY", "us"),
            ("COMPWATCH_SUMMARY_PATH", "/tmp/report.txt"),
            ("COMPWATCH_HTTP_TIMEOUT_SECS", "15"),
            ("COMPWATCH_SEARCH_RANGE_DAYS", "0"),
        ]);
        let overrides =
            ConfigOverrides::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        let config = WatchConfig::default().with_overrides(overrides);

        assert_eq!(config.country.as_str(), "US");
        assert_eq!(config.summary_path, PathBuf::from("/tmp/report.txt"));
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.search_range(), None);
        assert_eq!(config.header_marker(), "Upcoming WCA competitions in US");
        assert_eq!(config.notify_command, DEFAULT_NOTIFY_COMMAND);
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let bad_country = ConfigOverrides::from_lookup(|k| {
            (k == "COMPWATCH_COUNTRY").then(|| "Canada".to_string())
        });
        assert!(bad_country.is_err());

        let bad_timeout = ConfigOverrides::from_lookup(|k| {
            (k == "COMPWATCH_HTTP_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(bad_timeout.is_err());
    }

    #[test]
    fn yaml_file_overrides_selected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compwatch.yaml");
        std::fs::write(
            &path,
            "country: gb\nseen_ids_path: /var/lib/compwatch/seen\nheader_marker: \"WCA watch\"\n",
        )
        .unwrap();

        let config = WatchConfig::default()
            .with_overrides(ConfigOverrides::from_yaml_file(&path).unwrap());
        assert_eq!(config.country.as_str(), "GB");
        assert_eq!(config.seen_ids_path, PathBuf::from("/var/lib/compwatch/seen"));
        assert_eq!(config.header_marker(), "WCA watch");
        assert_eq!(config.http_timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
    }

    #[test]
    fn yaml_with_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compwatch.yaml");
        std::fs::write(&path, "contry: CA\n").unwrap();
        assert!(ConfigOverrides::from_yaml_file(&path).is_err());
    }

    #[test]
    fn empty_yaml_file_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compwatch.yaml");
        std::fs::write(&path, "\n").unwrap();
        let overrides = ConfigOverrides::from_yaml_file(&path).unwrap();
        assert!(overrides.country.is_none());
        assert!(overrides.summary_path.is_none());
    }
}
