use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ActivationError;

/// Family of telemetry an activation rule controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum TelemetryKind {
    Trace,
    Log,
    Metric,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [TelemetryKind::Trace, TelemetryKind::Log, TelemetryKind::Metric];

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Trace => "TRACE",
            TelemetryKind::Log => "LOG",
            TelemetryKind::Metric => "METRIC",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TelemetryKind {
    type Err = ActivationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(TelemetryKind::Trace),
            "LOG" => Ok(TelemetryKind::Log),
            "METRIC" => Ok(TelemetryKind::Metric),
            _ => Err(ActivationError::UnknownTelemetryKind(value.to_string())),
        }
    }
}

impl TryFrom<String> for TelemetryKind {
    type Error = ActivationError;

    fn try_from(value: String) -> Result<Self, ActivationError> {
        value.parse()
    }
}

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Ordinal priority: `Trace` = 1 up to `Fatal` = 6.
    pub fn priority(&self) -> u8 {
        match self {
            LogLevel::Trace => 1,
            LogLevel::Debug => 2,
            LogLevel::Info => 3,
            LogLevel::Warn => 4,
            LogLevel::Error => 5,
            LogLevel::Fatal => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Whether an event at `self` passes a rule whose threshold is `threshold`.
    pub fn satisfies(&self, threshold: LogLevel) -> bool {
        self.priority() >= threshold.priority()
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ActivationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(ActivationError::UnknownLogLevel(value.to_string())),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ActivationError;

    fn try_from(value: String) -> Result<Self, ActivationError> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kinds_case_insensitively() {
        assert_eq!("trace".parse::<TelemetryKind>().unwrap(), TelemetryKind::Trace);
        assert_eq!(" Metric ".parse::<TelemetryKind>().unwrap(), TelemetryKind::Metric);
        assert!(matches!(
            "span".parse::<TelemetryKind>(),
            Err(ActivationError::UnknownTelemetryKind(_))
        ));
    }

    #[test]
    fn level_priorities_follow_severity() {
        assert_eq!(LogLevel::Trace.priority(), 1);
        assert_eq!(LogLevel::Fatal.priority(), 6);
        assert!(LogLevel::Warn.satisfies(LogLevel::Info));
        assert!(LogLevel::Info.satisfies(LogLevel::Info));
        assert!(!LogLevel::Debug.satisfies(LogLevel::Info));
    }

    #[test]
    fn rejects_unknown_levels_through_serde() {
        let parsed: Result<LogLevel, _> = serde_json::from_str("\"verbose\"");
        assert!(parsed.is_err());
        let parsed: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(parsed, LogLevel::Warn);
    }

    #[test]
    fn converts_owned_strings() {
        assert_eq!(LogLevel::try_from(String::from("error")).unwrap(), LogLevel::Error);
        assert_eq!(TelemetryKind::try_from(String::from("log")).unwrap(), TelemetryKind::Log);
        assert!(matches!(
            LogLevel::try_from(String::from("loud")),
            Err(ActivationError::UnknownLogLevel(_))
        ));
    }
}
