//! Data model shared by the ingest loop and the dashboard: the CSV column
//! layout, how a raw serial line becomes a reading, and the chart render.

mod chart;

pub use chart::{normalize_header, render, ChartPoint, ChartSpec, CsvSnapshot, CHART_COUNT};

pub const TIMESTAMP: &str = "Timestamp";
pub const LIGHT_LEVEL: &str = "Light Level (%)";
pub const GAS_CONCENTRATION: &str = "Gas Concentration (MQ135)";
pub const HUMIDITY: &str = "Humidity (%)";
pub const TEMPERATURE: &str = "Temperature (°C)";

static TIMESTAMPED_HEADER: [&str; 5] = [
    TIMESTAMP,
    LIGHT_LEVEL,
    GAS_CONCENTRATION,
    HUMIDITY,
    TEMPERATURE,
];

/// Column layout of the CSV log.
///
/// The layout is always chosen explicitly. Guessing it from the token count of
/// incoming lines is ambiguous, so there is no auto-detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Schema {
    /// Light, gas, humidity, temperature.
    Untimed,
    /// A leading timestamp followed by the four sensor columns.
    #[default]
    Timestamped,
}

impl Schema {
    pub fn from_timestamp_column(timestamp_column: bool) -> Self {
        if timestamp_column {
            Self::Timestamped
        } else {
            Self::Untimed
        }
    }

    pub fn has_timestamp(&self) -> bool {
        matches!(self, Self::Timestamped)
    }

    /// The header row written once at the top of a fresh log.
    pub fn header(&self) -> &'static [&'static str] {
        match self {
            Self::Timestamped => &TIMESTAMPED_HEADER,
            Self::Untimed => &TIMESTAMPED_HEADER[1..],
        }
    }

    /// Number of tokens a line must have to be logged.
    pub fn arity(&self) -> usize {
        self.header().len()
    }

    /// Decides what to do with one decoded, trimmed serial line.
    ///
    /// Lines containing `error_marker` are sensor-side errors. An empty marker
    /// disables that check. Every other line is split on commas and kept only
    /// when the token count matches [`Schema::arity`]. Tokens are kept as text.
    pub fn classify(&self, line: &str, error_marker: &str) -> LineVerdict {
        if !error_marker.is_empty() && line.contains(error_marker) {
            return LineVerdict::SensorError;
        }

        let tokens: Vec<&str> = line.split(',').collect();
        if tokens.len() != self.arity() {
            return LineVerdict::ArityMismatch {
                expected: self.arity(),
                found: tokens.len(),
            };
        }

        LineVerdict::Reading(Reading(tokens.into_iter().map(str::to_owned).collect()))
    }
}

/// One validated row of sensor values, in header order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reading(Vec<String>);

impl Reading {
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of [`Schema::classify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineVerdict {
    Reading(Reading),
    SensorError,
    ArityMismatch { expected: usize, found: usize },
}
