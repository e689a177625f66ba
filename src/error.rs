use std::io;

use thiserror::Error;

use crate::mailer::MailerError;

/// Settings that can't be used. Fatal to starting the poller only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("poll interval must be at least one second")]
    InvalidInterval,
    #[error("nut timeout must be at least one second")]
    InvalidTimeout,
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
    #[error("failed to read settings: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> ConfigError {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mailer(#[from] MailerError),
    #[error("failed to spawn poller thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("http server failed: {0}")]
    Server(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
