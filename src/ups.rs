use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::nut::NutError;
use crate::status::{RawTelemetry, UpsState};

/// Anything that can list ups units and dump their variables.
///
/// Both calls may fail transiently; the [`Fetcher`] turns failures into a
/// [`FetchFailure`] so nothing above it ever sees a raw client error.
pub trait TelemetrySource: Send + Sync {
    fn list_units(&self) -> Result<Vec<String>, NutError>;
    fn get_variables(&self, unit: &str) -> Result<RawTelemetry, NutError>;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    fn list_units(&self) -> Result<Vec<String>, NutError> {
        (**self).list_units()
    }

    fn get_variables(&self, unit: &str) -> Result<RawTelemetry, NutError> {
        (**self).get_variables(unit)
    }
}

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("no ups units reported by the telemetry source")]
    NoUnits,
    #[error("failed to list ups units: {0}")]
    Discovery(#[source] NutError),
    #[error("failed to read variables for {unit}: {source}")]
    Variables {
        unit: String,
        #[source]
        source: NutError,
    },
}

/// Reads raw telemetry for one ups unit.
pub struct Fetcher {
    source: Box<dyn TelemetrySource>,
    unit: Option<String>,
}

impl Fetcher {
    /// Reads the first unit the source reports on every fetch.
    pub fn new(source: impl TelemetrySource + 'static) -> Fetcher {
        Fetcher {
            source: Box::new(source),
            unit: None,
        }
    }

    /// Reads `unit` directly, skipping discovery.
    pub fn for_unit(source: impl TelemetrySource + 'static, unit: impl Into<String>) -> Fetcher {
        Fetcher {
            source: Box::new(source),
            unit: Some(unit.into()),
        }
    }

    pub fn fetch(&self) -> Result<RawTelemetry, FetchFailure> {
        let unit = match &self.unit {
            Some(unit) => unit.clone(),
            None => self.discover()?,
        };

        debug!(unit = %unit, "Updating ups state from NUT");
        self.source
            .get_variables(&unit)
            .map_err(|source| FetchFailure::Variables { unit, source })
    }

    /// Fetches and normalizes in one go. Failures are logged and reported as
    /// the unknown state.
    pub fn fetch_state(&self) -> UpsState {
        match self.fetch() {
            Ok(raw) => UpsState::from_raw(Some(&raw)),
            Err(e) => {
                warn!(error = %e, "Error updating ups state from NUT");
                UpsState::from_raw(None)
            }
        }
    }

    // Only the first unit is read, any others are ignored.
    fn discover(&self) -> Result<String, FetchFailure> {
        self.source
            .list_units()
            .map_err(FetchFailure::Discovery)?
            .into_iter()
            .next()
            .ok_or(FetchFailure::NoUnits)
    }
}
