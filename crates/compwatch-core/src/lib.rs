//! Core domain model, clock abstraction and error taxonomy for compwatch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "compwatch-core";

/// Placeholder rendered for registration timestamps the remote has not published yet.
pub const UNSCHEDULED: &str = "TBA";

/// One announced competition, as listed by the remote competitions API.
///
/// Temporal fields are kept verbatim; only `registration_close` is ever interpreted,
/// see [`Competition::registration_close_at`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: String,
    pub name: String,
    pub website: String,
    pub city: String,
    pub announced_at: String,
    #[serde(deserialize_with = "present_but_nullable")]
    pub registration_open: Option<String>,
    #[serde(deserialize_with = "present_but_nullable")]
    pub registration_close: Option<String>,
    pub start_date: String,
    pub end_date: String,
}

// The key must exist in the payload; only its value may be null.
fn present_but_nullable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

impl Competition {
    /// Parsed registration deadline, or `None` when absent or not an RFC 3339 timestamp.
    pub fn registration_close_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.registration_close.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Fails open: an unknown deadline never counts as closed.
    pub fn is_registration_closed(&self, now: DateTime<Utc>) -> bool {
        match self.registration_close_at() {
            Some(close) => close <= now,
            None => false,
        }
    }
}

impl fmt::Display for Competition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self.registration_open.as_deref().unwrap_or(UNSCHEDULED);
        let close = self.registration_close.as_deref().unwrap_or(UNSCHEDULED);
        writeln!(f, "{}", self.name)?;
        writeln!(f, "    City:         {}", self.city)?;
        writeln!(f, "    Date:         {} to {}", self.start_date, self.end_date)?;
        writeln!(f, "    Registration: {open} to {close}")?;
        write!(f, "    Website:      {}", self.website)
    }
}

/// ISO 3166-1 alpha-2 country code, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("country code must be two ASCII letters, got {0:?}")]
pub struct InvalidCountryCode(pub String);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CountryCode {
    type Err = InvalidCountryCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(InvalidCountryCode(s.to_string()))
        }
    }
}

impl TryFrom<String> for CountryCode {
    type Error = InvalidCountryCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of "now" for deadline checks and report headers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Every failure that aborts a watch run.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("request to {url} failed with status {status}")]
    RemoteRequest { url: String, status: u16 },
    #[error("request to {url} could not be completed: {reason}")]
    RemoteUnreachable { url: String, reason: String },
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
    #[error("file access failed for {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("desktop notification failed: {0}")]
    Notification(String),
}

impl WatchError {
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = WatchError> = std::result::Result<T, E>;
