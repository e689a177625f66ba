use std::{net::SocketAddr, path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::broadcast::STATUS_CHANGE_EVENT;
use crate::error::ConfigError;
use crate::mailer::MailerSettings;

// The following define polling behaviour and where we listen.
const POLL_INTERVAL: u64 = 5; // Seconds between polls.
const LISTEN: &str = "127.0.0.1:8787";
const EVENT_BUFFER: usize = 16; // Messages buffered per slow event listener.

const NUT_HOST: &str = "127.0.0.1";
const NUT_PORT: u16 = 3493;
const NUT_TIMEOUT: u64 = 5; // Seconds before a upsd read or write is abandoned.

pub const DEFAULT_CONFIG_FILE: &str = "nut-relay.toml";
const ENV_PREFIX: &str = "NUT_RELAY_";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NutSettings {
    pub host: String,
    pub port: u16,
    /// Read this unit instead of the first one upsd lists.
    pub ups: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NutSettings {
    fn default() -> Self {
        NutSettings {
            host: NUT_HOST.to_string(),
            port: NUT_PORT,
            ups: None,
            username: None,
            password: None,
            timeout_secs: NUT_TIMEOUT,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub poll_interval: u64,
    pub listen: String,
    pub event_name: String,
    pub event_buffer: usize,
    pub nut: NutSettings,
    pub mailer: Option<MailerSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            poll_interval: POLL_INTERVAL,
            listen: LISTEN.to_string(),
            event_name: STATUS_CHANGE_EVENT.to_string(),
            event_buffer: EVENT_BUFFER,
            nut: NutSettings::default(),
            mailer: None,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file (if it exists), then `NUT_RELAY_*` env vars.
    ///
    /// Nested keys use a double underscore, e.g. `NUT_RELAY_NUT__HOST`.
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
        Settings::figment(path).extract().map_err(ConfigError::from)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.nut.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))
    }
}
