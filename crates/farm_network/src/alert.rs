//! Pest alert helpers: severity grading, recommendations, and a short
//! history of recent alerts for operator views.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::message::{Envelope, MessageId, Payload, PestAlert};

/// Trap counts at or above this are graded HIGH.
pub const HIGH_PEST_COUNT: u32 = 45;
/// Trap counts at or above this are graded MEDIUM.
pub const MEDIUM_PEST_COUNT: u32 = 30;

const RECENT_ALERTS_CAPACITY: usize = 10;

/// Outbreak severity carried by every pest alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Grade a sticky-trap count.
    pub fn from_pest_count(count: u32) -> Self {
        if count >= HIGH_PEST_COUNT {
            Self::High
        } else if count >= MEDIUM_PEST_COUNT {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// What a farmer receiving this alert should do.
    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            Self::Low => &[
                "Continue normal monitoring schedule",
                "Check sticky traps every 3 days",
                "Maintain good ventilation",
            ],
            Self::Medium => &[
                "Increase trap inspections to daily",
                "Prepare biological controls (ladybugs, lacewings)",
                "Monitor temperature and humidity closely",
                "Consider preventive neem oil application",
            ],
            Self::High => &[
                "IMMEDIATE ACTION REQUIRED",
                "Apply neem oil or insecticidal soap within 24 hours",
                "Remove heavily infested leaves and dispose properly",
                "Increase ventilation to reduce humidity below 60%",
                "Deploy sticky traps in high-density areas",
                "Check again in 48 hours to assess effectiveness",
                "Alert ministry extension officer if infestation persists",
            ],
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        })
    }
}

/// A detection event as produced by the local trap-counting pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PestDetection {
    pub pest_type: String,
    pub pest_count: u32,
    pub zone: String,
}

impl PestDetection {
    pub fn new(pest_type: impl Into<String>, pest_count: u32, zone: impl Into<String>) -> Self {
        Self {
            pest_type: pest_type.into(),
            pest_count,
            zone: zone.into(),
        }
    }

    /// Build the alert payload, grading severity from the count.
    pub fn to_alert(&self) -> PestAlert {
        PestAlert {
            severity: Severity::from_pest_count(self.pest_count),
            zone: self.zone.clone(),
            pest_type: Some(self.pest_type.clone()),
            pest_count: Some(self.pest_count),
            note: None,
        }
    }
}

/// Whether an alert was raised here or arrived from a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDirection {
    Sent,
    Received,
}

/// One entry in [`RecentAlerts`].
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub message_id: MessageId,
    pub origin: PeerId,
    pub alert: PestAlert,
    pub direction: AlertDirection,
    pub at: DateTime<Utc>,
}

/// Bounded history of the last alerts, newest last.
#[derive(Debug, Default)]
pub struct RecentAlerts {
    entries: VecDeque<AlertRecord>,
}

impl RecentAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an alert envelope. Non-alert envelopes are ignored.
    pub fn push(&mut self, envelope: &Envelope, direction: AlertDirection) {
        let Payload::PestAlert(alert) = envelope.payload() else {
            return;
        };
        self.entries.push_back(AlertRecord {
            message_id: envelope.id().clone(),
            origin: envelope.origin().clone(),
            alert: alert.clone(),
            direction,
            at: Utc::now(),
        });
        while self.entries.len() > RECENT_ALERTS_CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertRecord> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Query;

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(Severity::from_pest_count(0), Severity::Low);
        assert_eq!(Severity::from_pest_count(29), Severity::Low);
        assert_eq!(Severity::from_pest_count(30), Severity::Medium);
        assert_eq!(Severity::from_pest_count(44), Severity::Medium);
        assert_eq!(Severity::from_pest_count(45), Severity::High);
        assert!(Severity::High > Severity::Low);
    }

    #[test]
    fn test_recommendations_escalate() {
        assert_eq!(Severity::High.recommendations()[0], "IMMEDIATE ACTION REQUIRED");
        assert!(Severity::High.recommendations().len() > Severity::Low.recommendations().len());
    }

    #[test]
    fn test_detection_to_alert() {
        let alert = PestDetection::new("whitefly", 52, "north").to_alert();
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.zone, "north");
        assert_eq!(alert.pest_type.as_deref(), Some("whitefly"));
        assert_eq!(alert.pest_count, Some(52));
    }

    #[test]
    fn test_recent_alerts_keeps_last_ten() {
        let origin = PeerId::from_string("farm-a");
        let mut recent = RecentAlerts::new();
        for seq in 0..15 {
            let env = Envelope::new(
                origin.clone(),
                seq,
                Payload::PestAlert(PestAlert::new(Severity::Low, "east")),
                3,
            );
            recent.push(&env, AlertDirection::Sent);
        }
        assert_eq!(recent.len(), 10);
        let first = recent.iter().next().unwrap();
        assert_eq!(first.message_id.sequence(), Some(5));
    }

    #[test]
    fn test_recent_alerts_ignores_other_kinds() {
        let env = Envelope::new(
            PeerId::from_string("farm-a"),
            1,
            Payload::Query(Query { text: "hi".into() }),
            3,
        );
        let mut recent = RecentAlerts::new();
        recent.push(&env, AlertDirection::Received);
        assert!(recent.is_empty());
    }
}
