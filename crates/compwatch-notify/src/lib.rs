//! Desktop alerts for newly announced competitions.

use std::path::PathBuf;

use async_trait::async_trait;
use compwatch_core::{CountryCode, WatchError};
use tokio::process::Command;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "compwatch-notify";

pub const DEFAULT_NOTIFY_COMMAND: &str = "notify-send";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce `count` new competitions. Delivery failures are returned, never swallowed.
    async fn notify(&self, count: usize) -> Result<(), WatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationText {
    pub title: String,
    pub body: String,
}

pub fn notification_text(count: usize, country: &CountryCode) -> NotificationText {
    if count == 1 {
        NotificationText {
            title: "1 new WCA competition".to_string(),
            body: format!("1 competition has been announced in {country}."),
        }
    } else {
        NotificationText {
            title: format!("{count} new WCA competitions"),
            body: format!("{count} competitions have been announced in {country}."),
        }
    }
}

/// Sends alerts through a `notify-send` compatible command: `<cmd> -i <icon> <title> <body>`.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    command: String,
    icon: PathBuf,
    country: CountryCode,
}

impl DesktopNotifier {
    pub fn new(command: impl Into<String>, icon: impl Into<PathBuf>, country: CountryCode) -> Self {
        Self {
            command: command.into(),
            icon: icon.into(),
            country,
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, count: usize) -> Result<(), WatchError> {
        if count == 0 {
            debug!("nothing to announce");
            return Ok(());
        }

        let text = notification_text(count, &self.country);
        let output = Command::new(&self.command)
            .arg("-i")
            .arg(&self.icon)
            .arg(&text.title)
            .arg(&text.body)
            .output()
            .await
            .map_err(|err| WatchError::Notification(format!("running {}: {err}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WatchError::Notification(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        info!(count, title = %text.title, "notification sent");
        Ok(())
    }
}
