//! Notification models
//!
//! The unit flowing through the relay and its durable representation.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Provenance of a notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Content submitted through the ingress
    Submission,
    /// Synthetic event emitted by the periodic generator
    ClockTick,
}

impl Origin {
    /// Label used for metrics and log fields
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "submission",
            Self::ClockTick => "clock_tick",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Origin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submission" => Ok(Self::Submission),
            "clock_tick" => Ok(Self::ClockTick),
            _ => Err(anyhow::anyhow!("Invalid notification origin: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub content: String,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Submission-origin notification stamped now
    #[must_use]
    pub fn submission(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            origin: Origin::Submission,
            timestamp: Utc::now(),
        }
    }

    /// Clock-origin notification for a tick at `timestamp`
    #[must_use]
    pub fn clock_tick(timestamp: DateTime<Utc>) -> Self {
        Self {
            content: format_clock_message(timestamp),
            origin: Origin::ClockTick,
            timestamp,
        }
    }
}

/// `Event Driven Notification HH:MM:SS`, rendered in local time
#[must_use]
pub fn format_clock_message(timestamp: DateTime<Utc>) -> String {
    format!(
        "Event Driven Notification {}",
        timestamp.with_timezone(&Local).format("%H:%M:%S")
    )
}

/// Durable representation of a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub content: String,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
}

/// What a submitter gets back once their content is durably stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub record_id: i64,
    pub content: String,
}

impl Acknowledgement {
    /// Plain-text body echoed to the submitter
    #[must_use]
    pub fn message(&self) -> String {
        format!("Input notification \n {}\n", self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_origin_round_trip() {
        for origin in [Origin::Submission, Origin::ClockTick] {
            assert_eq!(origin.to_string().parse::<Origin>().unwrap(), origin);
        }
        assert!("broadcast".parse::<Origin>().is_err());
    }

    #[test]
    fn test_clock_tick_content() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 15).unwrap();
        let tick = Notification::clock_tick(at);

        assert_eq!(tick.origin, Origin::ClockTick);
        assert_eq!(tick.timestamp, at);
        assert!(tick.content.starts_with("Event Driven Notification "));
        let clock = tick.content.trim_start_matches("Event Driven Notification ");
        assert_eq!(clock.len(), 8);
        assert_eq!(clock.matches(':').count(), 2);
    }

    #[test]
    fn test_acknowledgement_echoes_content() {
        let ack = Acknowledgement {
            record_id: 7,
            content: "hello".to_string(),
        };
        assert!(ack.message().contains("hello"));
        assert!(ack.message().starts_with("Input notification"));
    }
}
