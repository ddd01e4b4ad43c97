//! Broker channel naming
//!
//! Shared vocabulary mapping logical event kinds to broker channel names.
//! Submissions publish on the submission channel, clock ticks on the clock
//! channel, and listener connections subscribe to the broadcast channel. In
//! the default topology the clock channel is the broadcast channel, so
//! listeners only see clock-origin traffic.

use serde::{Deserialize, Serialize};

use crate::models::Origin;

/// Channel carrying accepted submissions
pub const SUBMISSION_CHANNEL: &str = "input_notifications";

/// Channel carrying periodic clock events
pub const CLOCK_CHANNEL: &str = "notifications";

/// Channel consumed by listener connections
pub const BROADCAST_CHANNEL: &str = "notifications";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMap {
    pub submission: String,
    pub clock: String,
    pub broadcast: String,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            submission: SUBMISSION_CHANNEL.to_string(),
            clock: CLOCK_CHANNEL.to_string(),
            broadcast: BROADCAST_CHANNEL.to_string(),
        }
    }
}

impl ChannelMap {
    /// Channel a notification of the given origin is published on
    #[must_use]
    pub fn for_origin(&self, origin: Origin) -> &str {
        match origin {
            Origin::Submission => &self.submission,
            Origin::ClockTick => &self.clock,
        }
    }

    /// Channels observed by the inbound subscriber, without duplicates
    #[must_use]
    pub fn inbound(&self) -> Vec<String> {
        let mut channels = vec![self.submission.clone()];
        if self.clock != self.submission {
            channels.push(self.clock.clone());
        }
        channels
    }

    /// `(key, value)` pairs, used for validation messages
    #[must_use]
    pub fn named(&self) -> [(&'static str, &str); 3] {
        [
            ("submission", self.submission.as_str()),
            ("clock", self.clock.as_str()),
            ("broadcast", self.broadcast.as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_routing() {
        let channels = ChannelMap::default();
        assert_eq!(channels.for_origin(Origin::Submission), "input_notifications");
        assert_eq!(channels.for_origin(Origin::ClockTick), "notifications");
        // Listeners receive clock traffic only
        assert_eq!(channels.for_origin(Origin::ClockTick), channels.broadcast);
        assert_ne!(channels.for_origin(Origin::Submission), channels.broadcast);
    }

    #[test]
    fn test_inbound_deduplicates() {
        let channels = ChannelMap::default();
        assert_eq!(channels.inbound(), vec!["input_notifications", "notifications"]);

        let shared = ChannelMap {
            submission: "all".to_string(),
            clock: "all".to_string(),
            broadcast: "all".to_string(),
        };
        assert_eq!(shared.inbound(), vec!["all"]);
    }
}
