//! Polls a NUT `upsd` daemon, reduces its variables to a small
//! `{status, charge, runtime}` record and republishes it: every poll as a
//! snapshot, and once per online/on-battery flip as a status change event.

pub mod broadcast;
pub mod error;
pub mod logging;
pub mod mailer;
pub mod monitor;
pub mod nut;
pub mod poller;
pub mod server;
pub mod settings;
pub mod status;
pub mod store;
pub mod transition;
pub mod ups;

pub use broadcast::{Broadcaster, EventHub, Fanout, Message};
pub use error::{ConfigError, Error};
pub use monitor::UpsMonitor;
pub use nut::{NutClient, NutError};
pub use status::{RawTelemetry, UpsState, UpsStatus};
pub use ups::{FetchFailure, Fetcher, TelemetrySource};
