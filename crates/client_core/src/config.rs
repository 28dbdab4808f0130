use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::feed::{FeedOrdering, SubscriberSettings};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub subscribe_retry_attempts: usize,
    pub subscribe_retry_delay_ms: u64,
    pub feed_ordering: FeedOrdering,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            subscribe_retry_attempts: 3,
            subscribe_retry_delay_ms: 500,
            feed_ordering: FeedOrdering::StoreOrder,
        }
    }
}

impl ClientSettings {
    pub fn subscriber_settings(&self) -> SubscriberSettings {
        SubscriberSettings {
            retry_attempts: self.subscribe_retry_attempts,
            retry_delay: Duration::from_millis(self.subscribe_retry_delay_ms),
            ordering: self.feed_ordering,
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RIDE_FEED_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("RIDE_FEED_SUBSCRIBE_RETRY_ATTEMPTS") {
            match v.parse() {
                Ok(parsed) => self.subscribe_retry_attempts = parsed,
                Err(err) => warn!(%err, "ignoring invalid RIDE_FEED_SUBSCRIBE_RETRY_ATTEMPTS"),
            }
        }
        if let Some(v) = lookup("RIDE_FEED_SUBSCRIBE_RETRY_DELAY_MS") {
            match v.parse() {
                Ok(parsed) => self.subscribe_retry_delay_ms = parsed,
                Err(err) => warn!(%err, "ignoring invalid RIDE_FEED_SUBSCRIBE_RETRY_DELAY_MS"),
            }
        }
        if let Some(v) = lookup("RIDE_FEED_ORDERING") {
            match v.parse() {
                Ok(parsed) => self.feed_ordering = parsed,
                Err(err) => warn!(%err, "ignoring invalid RIDE_FEED_ORDERING"),
            }
        }
    }
}

/// Defaults, then the settings file if present, then `RIDE_FEED_*` env vars.
pub fn load_client_settings(path: Option<&Path>) -> ClientSettings {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => {
                info!(path = %path.display(), "client: loaded settings file");
                parsed
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "client: ignoring malformed settings file");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
