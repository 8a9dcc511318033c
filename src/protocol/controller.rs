// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Activation controller.
//!
//! Owns the one active incident and drives it through the state machine.
//! User actions, governor signals and dispatch results are turned into
//! [`ProtocolEvent`]s, reduced, and the resulting [`Effect`]s are applied to the
//! ledger, the governor and the notification channels in order.
//!
//! Refused operations return a [`ProtocolError`] and change nothing. Accepted
//! operations return a [`Transition`] whose `warnings` list anything that
//! degraded along the way (no location fix, a failed ledger write).

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::error::{ProtocolError, ProtocolWarning};
use super::fsm::{CancelReason, Effect, Machine, ProtocolEvent, ProtocolState};
use super::governor::{GovernorSignal, SafetyGovernor};
use crate::config::SosConfig;
use crate::core::alerts::Severity;
use crate::core::geocode::{CompactGeocoder, FixedPointGeocoder};
use crate::core::incident::{
    actions, ConfirmationStep, EmergencyContact, Incident, Location, LogOutcome, StepPayload, StepType,
};
use crate::device::{ContactDirectory, LocationProvider, NoLocation, StaticDirectory, TelemetryWatch};
use crate::dispatch::queue::PENDING_KEY;
use crate::dispatch::{DispatchOutcome, TransmissionDispatcher};
use crate::ledger::{IncidentLedger, IncidentUpdate, LedgerError};
use crate::notify::{ChannelRegistry, Notification};

/// Report of an accepted operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub incident_id: String,
    pub from: ProtocolState,
    pub to: ProtocolState,
    pub warnings: Vec<ProtocolWarning>,
}

/// Returned by [`ActivationController::activate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationHandle {
    pub incident_id: String,
    /// An incident was already active and is being returned again.
    pub reused: bool,
    pub warnings: Vec<ProtocolWarning>,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub state: ProtocolState,
    pub cancellable: bool,
    pub final_confirmed: bool,
    pub incident_id: Option<String>,
    pub cancel_reason: Option<CancelReason>,
}

struct Applied {
    transition: Transition,
    noop: bool,
}

/// Turn a failed ledger write into a warning.
fn note(result: Result<(), LedgerError>, warnings: &mut Vec<ProtocolWarning>) {
    if let Err(e) = result {
        tracing::warn!("protocol: ledger write failed: {}", e);
        warnings.push(ProtocolWarning::StorageWriteFailure(e.to_string()));
    }
}

pub struct ActivationController {
    config: SosConfig,
    ledger: Arc<IncidentLedger>,
    dispatcher: Arc<TransmissionDispatcher>,
    location: Arc<dyn LocationProvider>,
    directory: Arc<dyn ContactDirectory>,
    geocoder: Arc<dyn CompactGeocoder>,
    telemetry: TelemetryWatch,
    channels: ChannelRegistry,
    governor: SafetyGovernor,
    signals: mpsc::Receiver<GovernorSignal>,
    machine: Machine,
    incident_id: Option<String>,
}

impl ActivationController {
    /// Controller with no location provider, the configured contacts and the
    /// fixed-point geocoder. Use the `with_*` methods to replace collaborators.
    pub fn new(
        config: SosConfig,
        ledger: Arc<IncidentLedger>,
        dispatcher: Arc<TransmissionDispatcher>,
        telemetry: TelemetryWatch,
    ) -> Self {
        let (governor, signals) = SafetyGovernor::new(config.step_timeout(), config.session_ceiling());
        let directory = Arc::new(StaticDirectory::new(config.emergency_contacts.clone()));
        Self {
            config,
            ledger,
            dispatcher,
            location: Arc::new(NoLocation),
            directory,
            geocoder: Arc::new(FixedPointGeocoder),
            telemetry,
            channels: ChannelRegistry::new(),
            governor,
            signals,
            machine: Machine::new(),
            incident_id: None,
        }
    }

    pub fn with_location_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = provider;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ContactDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn CompactGeocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = channels;
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.machine.state
    }

    pub fn incident_id(&self) -> Option<&str> {
        self.incident_id.as_deref()
    }

    pub fn dispatcher(&self) -> Arc<TransmissionDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.machine.state,
            cancellable: self.machine.cancellable,
            final_confirmed: self.machine.final_confirmed,
            incident_id: self.incident_id.clone(),
            cancel_reason: self.machine.cancel_reason,
        }
    }

    fn active_id(&self) -> Result<String, ProtocolError> {
        self.incident_id.clone().ok_or(ProtocolError::NoActiveIncident)
    }

    /// Record a refused request against the current incident and pass the error on.
    fn rejected(&self, err: ProtocolError) -> ProtocolError {
        tracing::warn!("protocol: request rejected: {}", err);
        if let (Some(id), true) = (
            &self.incident_id,
            matches!(err, ProtocolError::StateMismatch { .. } | ProtocolError::NotCancellable { .. }),
        ) {
            if let Err(e) = self.ledger.log_action(id, actions::REQUEST_REJECTED, LogOutcome::Warning, &err.to_string(), None) {
                tracing::warn!("protocol: ledger write failed: {}", e);
            }
        }
        err
    }

    /// Reduce one event and carry out its effects.
    fn apply(
        &mut self,
        event: ProtocolEvent,
        mut payload: Option<StepPayload>,
        mut warnings: Vec<ProtocolWarning>,
    ) -> Result<Applied, ProtocolError> {
        let from = self.machine.state;
        let reduction = self.machine.reduce(&event)?;
        let id = self.active_id()?;
        let noop = reduction.is_noop();
        self.machine = reduction.machine;

        for effect in reduction.effects {
            match effect {
                Effect::RecordStep(step) => {
                    let entry = ConfirmationStep::confirmed(step, payload.take());
                    note(self.ledger.log_confirmation_step(&id, entry), &mut warnings);
                }
                Effect::SetStatus(status) => {
                    note(self.ledger.update_incident(&id, IncidentUpdate::status(status)), &mut warnings);
                }
                Effect::Log { action, outcome, message, data } => {
                    note(self.ledger.log_action(&id, action, outcome, &message, data), &mut warnings);
                }
                Effect::StartSession { session } => self.governor.start_session(session),
                Effect::ArmStepTimer { epoch } => self.governor.arm_step(epoch),
                Effect::DisarmStepTimer => self.governor.disarm_step(),
                Effect::StopTimers => self.governor.stop_all(),
                // Callers that can dispatch check the resulting state.
                Effect::BeginDispatch => {}
            }
        }

        let to = self.machine.state;
        if from != to {
            tracing::info!("protocol: incident {} {} -> {}", id, from, to);
            self.announce(&id, to);
        }
        Ok(Applied {
            transition: Transition {
                incident_id: id,
                from,
                to,
                warnings,
            },
            noop,
        })
    }

    fn announce(&self, id: &str, state: ProtocolState) {
        let (severity, title, body) = match state {
            ProtocolState::Initial => (
                Severity::Critical,
                "SOS activated",
                "Emergency activation started; waiting for confirmation.".to_string(),
            ),
            ProtocolState::Completed => (
                Severity::Info,
                "Emergency protocol completed",
                "The incident was sent or queued for transmission.".to_string(),
            ),
            ProtocolState::Cancelled => (
                Severity::Warning,
                "Emergency protocol cancelled",
                match self.machine.cancel_reason {
                    Some(CancelReason::User) => "Cancelled by the user.".to_string(),
                    Some(reason) => format!("Cancelled automatically ({:?}).", reason),
                    None => "Cancelled.".to_string(),
                },
            ),
            ProtocolState::Error => (
                Severity::Critical,
                "Emergency protocol failed",
                "The incident could not be delivered or queued.".to_string(),
            ),
            _ => return,
        };
        self.channels
            .broadcast(Notification::new(severity, title.to_string(), body, Some(id.to_string())));
    }

    /// Start a new incident, or return the one already in progress.
    pub fn activate(&mut self) -> Result<ActivationHandle, ProtocolError> {
        if self.machine.state.is_active() {
            if let Some(id) = &self.incident_id {
                tracing::debug!("protocol: activate while {} is active, reusing it", id);
                return Ok(ActivationHandle {
                    incident_id: id.clone(),
                    reused: true,
                    warnings: Vec::new(),
                });
            }
        }

        let telemetry = self.telemetry.snapshot();
        let incident = Incident::new(telemetry.battery_level, telemetry.device_info, self.directory.contacts());
        let id = incident.id.clone();
        let mut warnings = Vec::new();
        note(self.ledger.log_incident(incident), &mut warnings);
        self.incident_id = Some(id.clone());

        let applied = self.apply(ProtocolEvent::Activate, None, warnings)?;
        Ok(ActivationHandle {
            incident_id: id,
            reused: false,
            warnings: applied.transition.warnings,
        })
    }

    /// Confirm the current step.
    ///
    /// At the location step an explicit location payload is used as-is;
    /// otherwise a fix is requested, bounded by the location timeout. Once the
    /// confirm is accepted the step countdown is stopped, so a slow fix cannot
    /// cancel it. At the contacts step a non-empty contact list replaces the
    /// incident's contacts.
    pub async fn confirm_step(&mut self, step: StepType, payload: Option<StepPayload>) -> Result<Transition, ProtocolError> {
        // Expiries that fired before this request are applied first.
        self.pump();
        if let Err(e) = self.machine.reduce(&ProtocolEvent::Confirm(step)) {
            return Err(self.rejected(e));
        }
        let id = self.active_id()?;

        let payload = match step {
            StepType::Location => {
                self.governor.disarm_step();
                self.resolve_location(&id, payload).await.map(StepPayload::Location)
            }
            StepType::Contacts => {
                let (contacts, _) = self.resolve_contacts(&id, payload);
                Some(StepPayload::Contacts(contacts))
            }
            _ => payload,
        };

        let mut transition = match self.apply(ProtocolEvent::Confirm(step), payload.clone(), Vec::new()) {
            Ok(applied) => applied.transition,
            Err(e) => return Err(self.rejected(e)),
        };
        let warnings = &mut transition.warnings;
        match (step, payload) {
            (StepType::Location, Some(StepPayload::Location(location))) => {
                self.record_location(&id, location, warnings)
            }
            (StepType::Location, _) => self.record_location_unavailable(&id, warnings),
            (StepType::Contacts, Some(StepPayload::Contacts(contacts))) => {
                self.record_contacts(&id, contacts, warnings)
            }
            _ => {}
        }
        Ok(transition)
    }

    async fn acquire_location(&self) -> Option<Location> {
        let limit = self.config.location_timeout();
        match tokio::time::timeout(limit, self.location.current_location(limit)).await {
            Ok(fix) => fix,
            Err(_) => {
                tracing::warn!("protocol: location request timed out after {:?}", limit);
                None
            }
        }
    }

    /// A supplied fix, or one from the provider. Fixes with non-finite or
    /// out-of-range values are discarded.
    async fn resolve_location(&self, id: &str, payload: Option<StepPayload>) -> Option<Location> {
        let supplied = match payload {
            Some(StepPayload::Location(location)) if location.is_valid() => return Some(self.with_code(location)),
            Some(StepPayload::Location(location)) => Some(location),
            _ => None,
        };
        if let Some(bad) = supplied {
            tracing::warn!("protocol: incident {} discarding invalid supplied fix {:?}", id, bad);
        }
        match self.acquire_location().await {
            Some(location) if location.is_valid() => Some(self.with_code(location)),
            Some(bad) => {
                tracing::warn!("protocol: incident {} discarding invalid fix {:?}", id, bad);
                None
            }
            None => None,
        }
    }

    fn with_code(&self, mut location: Location) -> Location {
        if self.config.enable_compact_geocode && location.compact_code.is_none() {
            location.compact_code = Some(self.geocoder.encode(location.latitude, location.longitude));
        }
        location
    }

    fn record_location(&self, id: &str, location: Location, warnings: &mut Vec<ProtocolWarning>) {
        let data = json!({
            "latitude": location.latitude,
            "longitude": location.longitude,
            "accuracy": location.accuracy,
            "compact_code": location.compact_code,
        });
        note(self.ledger.update_incident(id, IncidentUpdate::location(location)), warnings);
        note(
            self.ledger
                .log_action(id, actions::LOCATION_ACQUIRED, LogOutcome::Success, "location acquired", Some(data)),
            warnings,
        );
    }

    fn record_location_unavailable(&self, id: &str, warnings: &mut Vec<ProtocolWarning>) {
        tracing::warn!("protocol: incident {} has no location fix, continuing without one", id);
        warnings.push(ProtocolWarning::LocationUnavailable);
        note(
            self.ledger.log_action(
                id,
                actions::LOCATION_UNAVAILABLE,
                LogOutcome::Warning,
                "location could not be acquired; continuing without it",
                None,
            ),
            warnings,
        );
    }

    /// Contacts to record, and whether they replace the incident's current list.
    fn resolve_contacts(&self, id: &str, payload: Option<StepPayload>) -> (Vec<EmergencyContact>, bool) {
        match payload {
            Some(StepPayload::Contacts(mut chosen)) if !chosen.is_empty() => {
                chosen.sort_by_key(|c| c.priority);
                (chosen, true)
            }
            _ => {
                let current = self
                    .ledger
                    .get_incident(id)
                    .map(|i| i.contacts)
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| self.directory.contacts());
                (current, false)
            }
        }
    }

    fn record_contacts(&self, id: &str, contacts: Vec<EmergencyContact>, warnings: &mut Vec<ProtocolWarning>) {
        let ids: Vec<&str> = contacts.iter().map(|c| c.id.as_str()).collect();
        let data = json!({ "contacts": ids });
        let message = format!("{} contact(s) selected", contacts.len());
        let replaces = self
            .ledger
            .get_incident(id)
            .map_or(true, |i| i.contacts != contacts);
        if replaces {
            note(self.ledger.update_incident(id, IncidentUpdate::contacts(contacts)), warnings);
        }
        note(
            self.ledger
                .log_action(id, actions::CONTACTS_SELECTED, LogOutcome::Success, &message, Some(data)),
            warnings,
        );
    }

    /// Cancel the active incident. Fails with `NotCancellable` once execution began.
    pub fn cancel(&mut self) -> Result<Transition, ProtocolError> {
        match self.apply(ProtocolEvent::Cancel, None, Vec::new()) {
            Ok(applied) => Ok(applied.transition),
            Err(e) => Err(self.rejected(e)),
        }
    }

    /// Enter `Executing`: cancellation is closed off and a snapshot of the
    /// incident is written to the pending-delivery slot, where it stays until a
    /// delivery succeeds. The caller hands the incident to the dispatcher and
    /// reports back through [`finish_execution`](Self::finish_execution).
    pub fn begin_execution(&mut self) -> Result<Transition, ProtocolError> {
        let mut transition = match self.apply(ProtocolEvent::Execute, None, Vec::new()) {
            Ok(applied) => applied.transition,
            Err(e) => return Err(self.rejected(e)),
        };
        let id = transition.incident_id.clone();
        let stored = match self.ledger.get_incident(&id) {
            Some(incident) => self.dispatcher.store_snapshot(&incident).map_err(|e| e.to_string()),
            None => Err(format!("incident {} not in ledger", id)),
        };
        let entry = match stored {
            Ok(()) => self.ledger.log_action(
                &id,
                actions::DATA_STORED,
                LogOutcome::Success,
                "incident snapshot stored for redundant delivery",
                Some(json!({ "key": PENDING_KEY })),
            ),
            Err(e) => {
                tracing::warn!("protocol: snapshot of {} not stored: {}", id, e);
                transition.warnings.push(ProtocolWarning::StorageWriteFailure(e.clone()));
                self.ledger.log_action(
                    &id,
                    actions::DATA_STORED,
                    LogOutcome::Error,
                    &format!("incident snapshot could not be stored: {}", e),
                    None,
                )
            }
        };
        note(entry, &mut transition.warnings);
        Ok(transition)
    }

    /// Resolve `Executing` from the dispatcher's outcome. Delivered or queued
    /// completes the incident; anything else ends in `Error` and is returned as
    /// `TransmissionFailure`.
    pub fn finish_execution(&mut self, outcome: DispatchOutcome) -> Result<Transition, ProtocolError> {
        let delivered = outcome.is_resolved();
        let applied = self.apply(ProtocolEvent::DispatchResolved { delivered }, None, Vec::new())?;
        match outcome {
            DispatchOutcome::Failed { attempts, reason } => Err(ProtocolError::TransmissionFailure { attempts, reason }),
            _ => Ok(applied.transition),
        }
    }

    /// Execute from `FinalConfirm` and wait for the dispatcher.
    pub async fn execute_final(&mut self) -> Result<Transition, ProtocolError> {
        let started = self.begin_execution()?;
        let outcome = self.dispatcher.dispatch(&started.incident_id).await;
        // Ceiling signals that arrived during dispatch are advisory now.
        self.pump();
        let mut finished = self.finish_execution(outcome)?;
        let mut warnings = started.warnings;
        warnings.append(&mut finished.warnings);
        finished.from = started.from;
        finished.warnings = warnings;
        Ok(finished)
    }

    /// Feed one governor signal to the state machine. `None` if it was stale.
    pub fn handle_signal(&mut self, signal: GovernorSignal) -> Option<Transition> {
        let event = match signal {
            GovernorSignal::StepTimeout { epoch } => ProtocolEvent::StepTimeout { epoch },
            GovernorSignal::SessionExpired { session } => ProtocolEvent::SessionExpired { session },
        };
        match self.apply(event, None, Vec::new()) {
            Ok(applied) if !applied.noop => Some(applied.transition),
            Ok(_) => {
                tracing::debug!("protocol: stale {:?} ignored", signal);
                None
            }
            Err(e) => {
                tracing::debug!("protocol: {:?} not applicable: {}", signal, e);
                None
            }
        }
    }

    /// Apply every signal that has already fired.
    pub fn pump(&mut self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            if let Some(t) = self.handle_signal(signal) {
                transitions.push(t);
            }
        }
        transitions
    }

    /// Wait for the next governor signal.
    pub async fn next_signal(&mut self) -> Option<GovernorSignal> {
        self.signals.recv().await
    }

    /// Stop all timers. The incident, if any, stays in the ledger as it is.
    pub fn dispose(&mut self) {
        self.governor.stop_all();
        tracing::debug!("protocol: controller disposed in state {}", self.machine.state);
    }
}
