use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw NUT variables for a single ups unit, e.g. `ups.status` -> `OL CHRG`.
pub type RawTelemetry = HashMap<String, String>;

// NUT variable names we reduce to the canonical state.
pub const STATUS_VAR: &str = "ups.status";
pub const CHARGE_VAR: &str = "battery.charge";
pub const RUNTIME_VAR: &str = "battery.runtime";

// Flags packed into `ups.status`.
const ONLINE_FLAG: &str = "OL";
const ON_BATTERY_FLAG: &str = "OB";

/// Sentinel for a charge or runtime the ups did not report.
pub const NOT_REPORTED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpsStatus {
    #[serde(rename = "OL")]
    Online,
    #[serde(rename = "OB")]
    OnBattery,
    #[serde(rename = "UNK")]
    Unknown,
}

impl UpsStatus {
    /// Reduces a NUT status string such as `OB LB` to a power status.
    ///
    /// The field packs several space separated flags, so this looks for the
    /// online and on-battery tokens rather than matching the whole value.
    /// Online wins if a confused driver reports both.
    pub fn from_flags(flags: &str) -> UpsStatus {
        let mut on_battery = false;
        for flag in flags.split_whitespace() {
            if flag == ONLINE_FLAG {
                return UpsStatus::Online;
            }
            if flag == ON_BATTERY_FLAG {
                on_battery = true;
            }
        }

        if on_battery {
            UpsStatus::OnBattery
        } else {
            UpsStatus::Unknown
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, UpsStatus::Unknown)
    }
}

/// The canonical state served to queries and pushed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsState {
    pub status: UpsStatus,
    /// Battery charge in percent, or [`NOT_REPORTED`].
    pub charge: i64,
    /// Estimated runtime in seconds, or [`NOT_REPORTED`].
    pub runtime: i64,
}

impl UpsState {
    pub fn new(status: UpsStatus, charge: i64, runtime: i64) -> UpsState {
        UpsState {
            status,
            charge,
            runtime,
        }
    }

    /// The "no signal" record used whenever the ups could not be read.
    pub fn unknown() -> UpsState {
        UpsState::new(UpsStatus::Unknown, NOT_REPORTED, NOT_REPORTED)
    }

    /// Normalizes raw telemetry. `None` stands for a failed fetch.
    ///
    /// This never fails: missing or malformed fields fall back to
    /// [`UpsStatus::Unknown`] and [`NOT_REPORTED`] independently.
    pub fn from_raw(raw: Option<&RawTelemetry>) -> UpsState {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return UpsState::unknown(),
        };

        let status = raw
            .get(STATUS_VAR)
            .map(|flags| UpsStatus::from_flags(flags))
            .unwrap_or(UpsStatus::Unknown);

        UpsState {
            status,
            charge: parse_charge(raw.get(CHARGE_VAR)),
            runtime: parse_runtime(raw.get(RUNTIME_VAR)),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.status.is_unknown()
    }
}

impl Default for UpsState {
    fn default() -> Self {
        UpsState::unknown()
    }
}

/// Charge is a percentage, anything outside 0..=100 is treated as unreported.
fn parse_charge(value: Option<&String>) -> i64 {
    match parse_reading(value) {
        charge @ 0..=100 => charge,
        _ => NOT_REPORTED,
    }
}

fn parse_runtime(value: Option<&String>) -> i64 {
    match parse_reading(value) {
        runtime if runtime >= 0 => runtime,
        _ => NOT_REPORTED,
    }
}

// Some drivers report `100.0` for charge, so fall back to a float parse and truncate.
fn parse_reading(value: Option<&String>) -> i64 {
    let value = match value {
        Some(value) => value.trim(),
        None => return NOT_REPORTED,
    };

    if let Ok(v) = value.parse::<i64>() {
        return v;
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v.abs() < i64::MAX as f64 => v.trunc() as i64,
        _ => NOT_REPORTED,
    }
}
