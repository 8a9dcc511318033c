// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Incident ledger: the single durable source of truth for all incidents.
//!
//! The [`IncidentLedger`] keeps every incident in memory (most recent first) and
//! writes the whole serialized ledger to its [`KeyValueStore`] after each
//! mutation. A failed write is returned to the caller but the in-memory state
//! is kept, so the protocol carries on and the next successful write persists
//! everything.
//!
//! `confirmation_steps` and `execution_log` are append-only: updates that would
//! drop or rewrite existing entries are rejected.

use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;

pub mod store;

use crate::core::incident::{
    actions, ConfirmationStep, EmergencyContact, ExecutionLogEntry, Incident, IncidentStatus,
    Location, LogOutcome, StepPayload,
};
use store::{KeyValueStore, MemoryStore, StoreError};

/// Store key holding the serialized ledger.
pub const LEDGER_KEY: &str = "emergency_incidents";

/// Why a ledger operation failed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("incident {0} not found")]
    NotFound(String),
    #[error("incident {0} already exists")]
    DuplicateId(String),
    #[error("update to incident {id} would shrink or rewrite {field}")]
    AppendOnlyViolation { id: String, field: &'static str },
    #[error("incident {id} cannot move from {from} to {to}")]
    StatusRegression {
        id: String,
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("incident {id} rejects a non-finite or out-of-range location")]
    InvalidLocation { id: String },
    #[error("stored ledger is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("failed to serialize ledger: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to persist ledger: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// The change was applied in memory but could not be written to the store.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, LedgerError::Store(_) | LedgerError::Serialize(_))
    }
}

/// Partial update merged into an existing incident by [`IncidentLedger::update_incident`].
#[derive(Debug, Clone, Default)]
pub struct IncidentUpdate {
    pub status: Option<IncidentStatus>,
    pub location: Option<Location>,
    pub contacts: Option<Vec<EmergencyContact>>,
    /// Must extend the current list; shorter or rewritten lists are rejected.
    pub confirmation_steps: Option<Vec<ConfirmationStep>>,
    /// Must extend the current list; shorter or rewritten lists are rejected.
    pub execution_log: Option<Vec<ExecutionLogEntry>>,
}

impl IncidentUpdate {
    pub fn status(status: IncidentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn location(location: Location) -> Self {
        Self {
            location: Some(location),
            ..Self::default()
        }
    }

    pub fn contacts(contacts: Vec<EmergencyContact>) -> Self {
        Self {
            contacts: Some(contacts),
            ..Self::default()
        }
    }
}

/// Incident counts. `pending + confirmed + cancelled + executed == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IncidentStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    pub executed: usize,
    pub last_24_hours: usize,
}

/// Append-only incident ledger over an injected store.
pub struct IncidentLedger {
    incidents: Mutex<Vec<Incident>>,
    store: Arc<dyn KeyValueStore>,
}

fn extends<T: PartialEq>(current: &[T], proposed: &[T]) -> bool {
    proposed.len() >= current.len() && proposed[..current.len()] == *current
}

impl IncidentLedger {
    /// Load the ledger from `store`. A missing key means an empty ledger.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, LedgerError> {
        let incidents = match store.get(LEDGER_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(LedgerError::Corrupt)?,
            None => Vec::new(),
        };
        Ok(Self {
            incidents: Mutex::new(incidents),
            store,
        })
    }

    /// Empty ledger backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self {
            incidents: Mutex::new(Vec::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn persist(&self, incidents: &[Incident]) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(incidents).map_err(LedgerError::Serialize)?;
        self.store.put(LEDGER_KEY, &bytes)?;
        Ok(())
    }

    /// Run `f` against one incident under the ledger lock, then persist.
    fn mutate<F>(&self, id: &str, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut Incident) -> Result<(), LedgerError>,
    {
        let mut incidents = self.incidents.lock().unwrap();
        let incident = incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        f(incident)?;
        self.persist(&incidents)
    }

    /// Insert a new incident at the head of the ledger and record `INCIDENT_CREATED`.
    pub fn log_incident(&self, mut incident: Incident) -> Result<(), LedgerError> {
        if incident.location.as_ref().map_or(false, |l| !l.is_valid()) {
            return Err(LedgerError::InvalidLocation { id: incident.id });
        }
        let mut incidents = self.incidents.lock().unwrap();
        if incidents.iter().any(|i| i.id == incident.id) {
            return Err(LedgerError::DuplicateId(incident.id));
        }
        incident.execution_log.push(ExecutionLogEntry::new(
            actions::INCIDENT_CREATED,
            LogOutcome::Success,
            "emergency incident registered",
            None,
        ));
        tracing::info!("ledger: incident {} registered", incident.id);
        incidents.insert(0, incident);
        self.persist(&incidents)
    }

    /// Merge `update` into incident `id`.
    ///
    /// Rejected without any change if the status would move backwards, an
    /// append-only list would lose or alter existing entries, or a location
    /// could not be serialized faithfully.
    pub fn update_incident(&self, id: &str, update: IncidentUpdate) -> Result<(), LedgerError> {
        self.mutate(id, |incident| {
            let bad_location = update.location.as_ref().map_or(false, |l| !l.is_valid())
                || update.confirmation_steps.as_ref().map_or(false, |steps| {
                    steps
                        .iter()
                        .any(|s| s.payload.as_ref().map_or(false, StepPayload::has_invalid_location))
                });
            if bad_location {
                return Err(LedgerError::InvalidLocation { id: incident.id.clone() });
            }
            if let Some(next) = update.status {
                if !incident.status.can_advance_to(next) {
                    return Err(LedgerError::StatusRegression {
                        id: incident.id.clone(),
                        from: incident.status,
                        to: next,
                    });
                }
            }
            if let Some(steps) = &update.confirmation_steps {
                if !extends(&incident.confirmation_steps, steps) {
                    return Err(LedgerError::AppendOnlyViolation {
                        id: incident.id.clone(),
                        field: "confirmation_steps",
                    });
                }
            }
            if let Some(log) = &update.execution_log {
                if !extends(&incident.execution_log, log) {
                    return Err(LedgerError::AppendOnlyViolation {
                        id: incident.id.clone(),
                        field: "execution_log",
                    });
                }
            }

            if let Some(status) = update.status {
                incident.status = status;
            }
            if let Some(location) = update.location {
                incident.location = Some(location);
            }
            if let Some(contacts) = update.contacts {
                incident.contacts = contacts;
            }
            if let Some(steps) = update.confirmation_steps {
                incident.confirmation_steps = steps;
            }
            if let Some(log) = update.execution_log {
                incident.execution_log = log;
            }
            Ok(())
        })
    }

    /// Append one entry to an incident's execution log.
    pub fn log_action(
        &self,
        id: &str,
        action: &str,
        outcome: LogOutcome,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), LedgerError> {
        self.mutate(id, |incident| {
            incident
                .execution_log
                .push(ExecutionLogEntry::new(action, outcome, message, data));
            Ok(())
        })
    }

    /// Append one confirmation step.
    pub fn log_confirmation_step(&self, id: &str, step: ConfirmationStep) -> Result<(), LedgerError> {
        self.mutate(id, |incident| {
            if step.payload.as_ref().map_or(false, StepPayload::has_invalid_location) {
                return Err(LedgerError::InvalidLocation { id: incident.id.clone() });
            }
            incident.confirmation_steps.push(step);
            Ok(())
        })
    }

    pub fn get_incident(&self, id: &str) -> Option<Incident> {
        self.incidents.lock().unwrap().iter().find(|i| i.id == id).cloned()
    }

    /// All incidents, most recent first.
    pub fn get_all_incidents(&self) -> Vec<Incident> {
        self.incidents.lock().unwrap().clone()
    }

    pub fn get_incidents_by_status(&self, status: IncidentStatus) -> Vec<Incident> {
        self.incidents
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.status == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.incidents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal incidents older than `days_to_keep` days. Incidents that are
    /// still pending or confirmed are kept regardless of age.
    ///
    /// Returns the number of incidents removed.
    pub fn clear_old_logs(&self, days_to_keep: u32) -> Result<usize, LedgerError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_to_keep));
        let mut incidents = self.incidents.lock().unwrap();
        let before = incidents.len();
        incidents.retain(|i| !(i.status.is_terminal() && i.timestamp < cutoff));
        let removed = before - incidents.len();
        if removed > 0 {
            tracing::info!("ledger: pruned {} incident(s) older than {} days", removed, days_to_keep);
            self.persist(&incidents)?;
        }
        Ok(removed)
    }

    /// Pretty-printed JSON of the full ledger.
    pub fn export_logs(&self) -> Result<String, LedgerError> {
        let incidents = self.incidents.lock().unwrap();
        serde_json::to_string_pretty(&*incidents).map_err(LedgerError::Serialize)
    }

    /// Counts by status plus incidents created in the last 24 hours.
    pub fn incident_stats(&self) -> IncidentStats {
        let since = Utc::now() - ChronoDuration::hours(24);
        let incidents = self.incidents.lock().unwrap();
        let mut stats = IncidentStats {
            total: incidents.len(),
            ..IncidentStats::default()
        };
        for incident in incidents.iter() {
            match incident.status {
                IncidentStatus::Pending => stats.pending += 1,
                IncidentStatus::Confirmed => stats.confirmed += 1,
                IncidentStatus::Cancelled => stats.cancelled += 1,
                IncidentStatus::Executed => stats.executed += 1,
            }
            if incident.timestamp > since {
                stats.last_24_hours += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::incident::StepType;

    fn make_incident() -> Incident {
        Incident::new(
            80,
            "test-device".to_string(),
            vec![EmergencyContact::new("911", "National Emergency", "911", 1)],
        )
    }

    fn aged(mut incident: Incident, days: i64, status: IncidentStatus) -> Incident {
        incident.timestamp = Utc::now() - ChronoDuration::days(days);
        incident.status = status;
        incident
    }

    #[test]
    fn test_log_incident_most_recent_first() {
        let ledger = IncidentLedger::in_memory();
        let first = make_incident();
        let second = make_incident();
        let (first_id, second_id) = (first.id.clone(), second.id.clone());

        ledger.log_incident(first).unwrap();
        ledger.log_incident(second).unwrap();

        let all = ledger.get_all_incidents();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second_id);
        assert_eq!(all[1].id, first_id);
        assert_eq!(all[0].count_action(actions::INCIDENT_CREATED), 1);
    }

    #[test]
    fn test_log_incident_rejects_duplicate() {
        let ledger = IncidentLedger::in_memory();
        let incident = make_incident();
        ledger.log_incident(incident.clone()).unwrap();
        assert!(matches!(
            ledger.log_incident(incident),
            Err(LedgerError::DuplicateId(_))
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_update_merges_scalars() {
        let ledger = IncidentLedger::in_memory();
        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();

        ledger
            .update_incident(&id, IncidentUpdate::location(Location::new(19.4326, -99.1332, 15.0)))
            .unwrap();
        ledger
            .update_incident(&id, IncidentUpdate::status(IncidentStatus::Confirmed))
            .unwrap();

        let stored = ledger.get_incident(&id).unwrap();
        assert_eq!(stored.status, IncidentStatus::Confirmed);
        assert_eq!(stored.location.unwrap().latitude, 19.4326);
    }

    #[test]
    fn test_update_rejects_status_regression() {
        let ledger = IncidentLedger::in_memory();
        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();
        ledger
            .update_incident(&id, IncidentUpdate::status(IncidentStatus::Cancelled))
            .unwrap();

        let err = ledger
            .update_incident(&id, IncidentUpdate::status(IncidentStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, LedgerError::StatusRegression { .. }));
        assert_eq!(ledger.get_incident(&id).unwrap().status, IncidentStatus::Cancelled);
    }

    #[test]
    fn test_update_never_shrinks_append_only_fields() {
        let ledger = IncidentLedger::in_memory();
        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();
        ledger
            .log_action(&id, "TEST", LogOutcome::Success, "one", None)
            .unwrap();
        ledger
            .log_confirmation_step(&id, ConfirmationStep::confirmed(StepType::Initial, None))
            .unwrap();

        let before = ledger.get_incident(&id).unwrap();

        let shrink_log = IncidentUpdate {
            execution_log: Some(Vec::new()),
            ..IncidentUpdate::default()
        };
        assert!(matches!(
            ledger.update_incident(&id, shrink_log),
            Err(LedgerError::AppendOnlyViolation { field: "execution_log", .. })
        ));

        let shrink_steps = IncidentUpdate {
            confirmation_steps: Some(Vec::new()),
            // Also carries a valid status change, which must not be applied.
            status: Some(IncidentStatus::Confirmed),
            ..IncidentUpdate::default()
        };
        assert!(matches!(
            ledger.update_incident(&id, shrink_steps),
            Err(LedgerError::AppendOnlyViolation { field: "confirmation_steps", .. })
        ));

        let mut rewritten = before.execution_log.clone();
        rewritten[0].message = "edited".to_string();
        let rewrite = IncidentUpdate {
            execution_log: Some(rewritten),
            ..IncidentUpdate::default()
        };
        assert!(ledger.update_incident(&id, rewrite).is_err());

        assert_eq!(ledger.get_incident(&id).unwrap(), before);

        // Extending is fine.
        let mut extended = before.execution_log.clone();
        extended.push(ExecutionLogEntry::new("TEST", LogOutcome::Warning, "two", None));
        ledger
            .update_incident(
                &id,
                IncidentUpdate {
                    execution_log: Some(extended),
                    ..IncidentUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(
            ledger.get_incident(&id).unwrap().execution_log.len(),
            before.execution_log.len() + 1
        );
    }

    #[test]
    fn test_mutation_of_unknown_incident() {
        let ledger = IncidentLedger::in_memory();
        assert!(matches!(
            ledger.log_action("missing", "X", LogOutcome::Error, "x", None),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_incidents_by_status() {
        let ledger = IncidentLedger::in_memory();
        ledger
            .log_incident(aged(make_incident(), 0, IncidentStatus::Executed))
            .unwrap();
        ledger.log_incident(make_incident()).unwrap();
        ledger.log_incident(make_incident()).unwrap();

        assert_eq!(ledger.get_incidents_by_status(IncidentStatus::Pending).len(), 2);
        assert_eq!(ledger.get_incidents_by_status(IncidentStatus::Executed).len(), 1);
        assert!(ledger.get_incidents_by_status(IncidentStatus::Cancelled).is_empty());
    }

    #[test]
    fn test_clear_old_logs_keeps_active_incidents() {
        let ledger = IncidentLedger::in_memory();
        let old_done = aged(make_incident(), 45, IncidentStatus::Executed);
        let old_cancelled = aged(make_incident(), 31, IncidentStatus::Cancelled);
        let old_pending = aged(make_incident(), 90, IncidentStatus::Pending);
        let old_confirmed = aged(make_incident(), 90, IncidentStatus::Confirmed);
        let recent_done = aged(make_incident(), 2, IncidentStatus::Executed);
        let kept: Vec<String> = [&old_pending, &old_confirmed, &recent_done]
            .iter()
            .map(|i| i.id.clone())
            .collect();

        for incident in [old_done, old_cancelled, old_pending, old_confirmed, recent_done] {
            ledger.log_incident(incident).unwrap();
        }

        assert_eq!(ledger.clear_old_logs(30).unwrap(), 2);
        let remaining: Vec<String> = ledger.get_all_incidents().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining.len(), 3);
        for id in kept {
            assert!(remaining.contains(&id));
        }

        // Nothing left to prune.
        assert_eq!(ledger.clear_old_logs(30).unwrap(), 0);
    }

    #[test]
    fn test_stats_are_exhaustive() {
        let ledger = IncidentLedger::in_memory();
        ledger.log_incident(make_incident()).unwrap();
        ledger
            .log_incident(aged(make_incident(), 0, IncidentStatus::Confirmed))
            .unwrap();
        ledger
            .log_incident(aged(make_incident(), 3, IncidentStatus::Cancelled))
            .unwrap();
        ledger
            .log_incident(aged(make_incident(), 5, IncidentStatus::Executed))
            .unwrap();
        ledger
            .log_incident(aged(make_incident(), 0, IncidentStatus::Executed))
            .unwrap();

        let stats = ledger.incident_stats();
        assert_eq!(stats.total, 5);
        assert_eq!(
            stats.pending + stats.confirmed + stats.cancelled + stats.executed,
            stats.total
        );
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.last_24_hours, 3);
    }

    #[test]
    fn test_persists_and_reloads() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ledger = IncidentLedger::open(Arc::clone(&store)).unwrap();
        assert!(ledger.is_empty());

        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();
        ledger
            .log_action(&id, actions::USER_CANCEL, LogOutcome::Warning, "cancelled", None)
            .unwrap();

        let reopened = IncidentLedger::open(store).unwrap();
        assert_eq!(reopened.get_incident(&id), ledger.get_incident(&id));
    }

    #[test]
    fn test_non_finite_location_rejected_and_ledger_stays_readable() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ledger = IncidentLedger::open(Arc::clone(&store)).unwrap();
        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();

        assert!(matches!(
            ledger.update_incident(&id, IncidentUpdate::location(Location::new(f64::NAN, -99.1, 15.0))),
            Err(LedgerError::InvalidLocation { .. })
        ));
        let step = ConfirmationStep::confirmed(
            StepType::Location,
            Some(StepPayload::Location(Location::new(19.4, f64::INFINITY, 15.0))),
        );
        assert!(matches!(
            ledger.log_confirmation_step(&id, step),
            Err(LedgerError::InvalidLocation { .. })
        ));

        let mut located = make_incident();
        located.location = Some(Location::new(95.0, 0.0, 1.0));
        assert!(matches!(ledger.log_incident(located), Err(LedgerError::InvalidLocation { .. })));

        let stored = ledger.get_incident(&id).unwrap();
        assert!(stored.location.is_none());
        assert!(stored.confirmation_steps.is_empty());
        let reopened = IncidentLedger::open(store).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get_incident(&id), Some(stored));
    }

    #[test]
    fn test_storage_failure_reported_but_state_kept() {
        let store = Arc::new(MemoryStore::new());
        let ledger = IncidentLedger::open(store.clone()).unwrap();
        let incident = make_incident();
        let id = incident.id.clone();
        ledger.log_incident(incident).unwrap();

        store.set_read_only(true);
        let err = ledger
            .log_action(&id, "WRITE_WHILE_FULL", LogOutcome::Success, "x", None)
            .unwrap_err();
        assert!(err.is_storage_failure());
        // In-memory ledger still has the entry.
        assert_eq!(ledger.get_incident(&id).unwrap().count_action("WRITE_WHILE_FULL"), 1);

        // Next successful write persists everything.
        store.set_read_only(false);
        ledger
            .log_action(&id, "AFTER", LogOutcome::Success, "y", None)
            .unwrap();
        let reopened = IncidentLedger::open(store).unwrap();
        assert_eq!(
            reopened.get_incident(&id).unwrap().count_action("WRITE_WHILE_FULL"),
            1
        );
    }

    #[test]
    fn test_corrupt_store_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.put(LEDGER_KEY, b"{not json").unwrap();
        assert!(matches!(
            IncidentLedger::open(store),
            Err(LedgerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_export_logs_is_json_array() {
        let ledger = IncidentLedger::in_memory();
        ledger.log_incident(make_incident()).unwrap();
        let exported = ledger.export_logs().unwrap();
        let parsed: Vec<Incident> = serde_json::from_str(&exported).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(exported.contains('\n'));
    }
}
