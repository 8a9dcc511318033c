// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Incident data model.
//!
//! An [`Incident`] is one emergency activation and its full history. The two
//! history vectors (`confirmation_steps`, `execution_log`) are append-only; the
//! ledger enforces that on every update.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Action names written to [`ExecutionLogEntry::action`].
pub mod actions {
    pub const INCIDENT_CREATED: &str = "INCIDENT_CREATED";
    pub const SOS_ACTIVATED: &str = "SOS_ACTIVATED";
    pub const STEP_CONFIRMED: &str = "STEP_CONFIRMED";
    pub const LOCATION_ACQUIRED: &str = "LOCATION_ACQUIRED";
    pub const LOCATION_UNAVAILABLE: &str = "LOCATION_UNAVAILABLE";
    pub const CONTACTS_SELECTED: &str = "CONTACTS_SELECTED";
    pub const REQUEST_REJECTED: &str = "REQUEST_REJECTED";
    pub const USER_CANCEL: &str = "USER_CANCEL";
    pub const AUTO_CANCEL: &str = "AUTO_CANCEL";
    pub const SESSION_CEILING_ADVISORY: &str = "SESSION_CEILING_ADVISORY";
    pub const EXECUTION_START: &str = "EXECUTION_START";
    pub const DATA_STORED: &str = "DATA_STORED";
    pub const TRANSMISSION_SUCCESS: &str = "TRANSMISSION_SUCCESS";
    pub const TRANSMISSION_FAILED: &str = "TRANSMISSION_FAILED";
    pub const OFFLINE_MODE_ACTIVATED: &str = "OFFLINE_MODE_ACTIVATED";
    pub const QUEUE_WRITE_FAILED: &str = "QUEUE_WRITE_FAILED";
    pub const QUEUE_CLEARED: &str = "QUEUE_CLEARED";
    pub const EXECUTION_COMPLETE: &str = "EXECUTION_COMPLETE";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
}

/// A coordinate fix, optionally carrying a compact geocode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in metres.
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact_code: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            compact_code: None,
        }
    }

    /// Finite coordinates within WGS84 bounds and a finite, non-negative accuracy.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.accuracy.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.accuracy >= 0.0
    }
}

/// A party to alert when the incident is broadcast. Lower `priority` is called first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub priority: u8,
}

impl EmergencyContact {
    pub fn new(id: &str, name: &str, phone: &str, priority: u8) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            priority,
        }
    }
}

/// Persisted lifecycle status of an incident.
///
/// Moves one way: `Pending → Confirmed → Executed`, with `Cancelled` reachable
/// from either non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Executed,
}

impl IncidentStatus {
    /// `Executed` and `Cancelled` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Executed | IncidentStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` respects the protocol order.
    /// Re-asserting the current status is allowed.
    pub fn can_advance_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Confirmed) | (Pending, Cancelled) => true,
            (Confirmed, Executed) | (Confirmed, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Confirmed => "confirmed",
            IncidentStatus::Cancelled => "cancelled",
            IncidentStatus::Executed => "executed",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(IncidentStatus::Pending),
            "confirmed" => Ok(IncidentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(IncidentStatus::Cancelled),
            "executed" => Ok(IncidentStatus::Executed),
            other => Err(format!("unknown incident status: {}", other)),
        }
    }
}

/// The four user-facing confirmation steps, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Initial,
    Location,
    Contacts,
    Final,
}

impl StepType {
    /// 1-based position in the protocol.
    pub fn index(&self) -> u8 {
        match self {
            StepType::Initial => 1,
            StepType::Location => 2,
            StepType::Contacts => 3,
            StepType::Final => 4,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Initial => write!(f, "initial"),
            StepType::Location => write!(f, "location"),
            StepType::Contacts => write!(f, "contacts"),
            StepType::Final => write!(f, "final"),
        }
    }
}

/// Data a user may attach when confirming a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepPayload {
    Location(Location),
    Contacts(Vec<EmergencyContact>),
}

/// One recorded advance through the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationStep {
    pub step_index: u8,
    pub step_type: StepType,
    pub timestamp: DateTime<Utc>,
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StepPayload>,
}

impl StepPayload {
    /// A location payload that cannot be stored faithfully.
    pub fn has_invalid_location(&self) -> bool {
        matches!(self, StepPayload::Location(l) if !l.is_valid())
    }
}

impl ConfirmationStep {
    pub fn confirmed(step_type: StepType, payload: Option<StepPayload>) -> Self {
        Self {
            step_index: step_type.index(),
            step_type,
            timestamp: Utc::now(),
            confirmed: true,
            payload,
        }
    }
}

/// Result classification of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutcome {
    Success,
    Error,
    Warning,
}

/// Append-only audit record of one action taken on an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub outcome: LogOutcome,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ExecutionLogEntry {
    pub fn new(action: &str, outcome: LogOutcome, message: &str, data: Option<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            outcome,
            message: message.to_string(),
            data,
        }
    }
}

/// One emergency activation and its complete history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub location: Option<Location>,
    pub battery_level: u8,
    pub device_info: String,
    pub contacts: Vec<EmergencyContact>,
    pub status: IncidentStatus,
    #[serde(default)]
    pub confirmation_steps: Vec<ConfirmationStep>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
}

impl Incident {
    /// Create a pending incident with a fresh UUID and the current timestamp.
    pub fn new(battery_level: u8, device_info: String, contacts: Vec<EmergencyContact>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            location: None,
            battery_level,
            device_info,
            contacts,
            status: IncidentStatus::Pending,
            confirmation_steps: Vec::new(),
            execution_log: Vec::new(),
        }
    }

    /// Number of log entries with the given action name.
    pub fn count_action(&self, action: &str) -> usize {
        self.execution_log.iter().filter(|e| e.action == action).count()
    }

    /// Most recent log entry, if any.
    pub fn last_entry(&self) -> Option<&ExecutionLogEntry> {
        self.execution_log.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_creation() {
        let incident = Incident::new(
            87,
            "pixel-8".to_string(),
            vec![EmergencyContact::new("911", "National Emergency", "911", 1)],
        );
        assert_eq!(incident.id.len(), 36);
        assert_eq!(incident.status, IncidentStatus::Pending);
        assert!(incident.location.is_none());
        assert!(incident.confirmation_steps.is_empty());
        assert!(incident.execution_log.is_empty());
        let age = Utc::now() - incident.timestamp;
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn test_status_order() {
        use IncidentStatus::*;
        assert!(Pending.can_advance_to(Confirmed));
        assert!(Pending.can_advance_to(Cancelled));
        assert!(Confirmed.can_advance_to(Executed));
        assert!(Confirmed.can_advance_to(Cancelled));
        assert!(!Confirmed.can_advance_to(Pending));
        assert!(!Executed.can_advance_to(Pending));
        assert!(!Executed.can_advance_to(Cancelled));
        assert!(!Cancelled.can_advance_to(Executed));
        assert!(!Pending.can_advance_to(Executed));
        assert!(Executed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Confirmed.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Executed".parse::<IncidentStatus>(), Ok(IncidentStatus::Executed));
        assert_eq!("canceled".parse::<IncidentStatus>(), Ok(IncidentStatus::Cancelled));
        assert!("done".parse::<IncidentStatus>().is_err());
    }

    #[test]
    fn test_step_payload_serialization() {
        let payload = StepPayload::Location(Location::new(19.4326, -99.1332, 15.0));
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["kind"], "location");
        assert_eq!(json["value"]["latitude"], 19.4326);

        let back: StepPayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, payload);
    }

    #[test]
    fn test_location_validity() {
        assert!(Location::new(19.4326, -99.1332, 15.0).is_valid());
        assert!(Location::new(-90.0, 180.0, 0.0).is_valid());
        assert!(!Location::new(f64::NAN, -99.1, 15.0).is_valid());
        assert!(!Location::new(19.4, f64::INFINITY, 15.0).is_valid());
        assert!(!Location::new(19.4, -99.1, f64::NEG_INFINITY).is_valid());
        assert!(!Location::new(91.0, -99.1, 15.0).is_valid());
        assert!(!Location::new(19.4, -181.0, 15.0).is_valid());
        assert!(!Location::new(19.4, -99.1, -1.0).is_valid());

        assert!(StepPayload::Location(Location::new(f64::NAN, 0.0, 0.0)).has_invalid_location());
        assert!(!StepPayload::Contacts(Vec::new()).has_invalid_location());
    }

    #[test]
    fn test_count_action() {
        let mut incident = Incident::new(50, "test".to_string(), Vec::new());
        incident
            .execution_log
            .push(ExecutionLogEntry::new(actions::AUTO_CANCEL, LogOutcome::Warning, "timeout", None));
        incident
            .execution_log
            .push(ExecutionLogEntry::new(actions::USER_CANCEL, LogOutcome::Warning, "user", None));
        assert_eq!(incident.count_action(actions::AUTO_CANCEL), 1);
        assert_eq!(incident.last_entry().map(|e| e.action.as_str()), Some(actions::USER_CANCEL));
    }
}
