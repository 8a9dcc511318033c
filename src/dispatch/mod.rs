// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Transmission dispatcher.
//!
//! Delivers an executing incident to the backend, retrying a bounded number of
//! times with linear backoff. When the device is offline, or every attempt
//! failed, the incident goes to the durable [`OutboundQueue`] instead. Each
//! attempt and the fallback are written to the incident's execution log.
//!
//! Delivery is at-least-once: a queued incident is replayed when connectivity
//! returns and removed from the queue once a delivery succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub mod http;
pub mod queue;

use crate::config::SosConfig;
use crate::core::incident::{actions, EmergencyContact, Incident, Location, LogOutcome};
use crate::device::TelemetryWatch;
use crate::ledger::{IncidentLedger, LedgerError};
use queue::{OutboundQueue, QueueError, QueuedMessage};

/// Wire payload for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionPayload {
    pub incident_id: String,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
    pub contacts: Vec<EmergencyContact>,
    pub battery_level: u8,
    pub device_info: String,
}

impl From<&Incident> for TransmissionPayload {
    fn from(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id.clone(),
            location: incident.location.clone(),
            timestamp: incident.timestamp,
            contacts: incident.contacts.clone(),
            battery_level: incident.battery_level,
            device_info: incident.device_info.clone(),
        }
    }
}

/// Remote receiver of emergency payloads.
#[async_trait]
pub trait TransmissionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn transmit(&self, payload: &TransmissionPayload) -> anyhow::Result<()>;
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    /// Not delivered, but durably queued for later transmission.
    Queued { attempts: u32 },
    /// Neither delivered nor queued.
    Failed { attempts: u32, reason: String },
}

impl DispatchOutcome {
    /// Delivered or queued: the incident will reach responders.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Total attempts per dispatch, at least 1.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub offline_queue: bool,
}

impl DispatchPolicy {
    pub fn from_config(config: &SosConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            backoff: config.retry_backoff(),
            offline_queue: config.enable_offline_queue,
        }
    }
}

/// Result of replaying the outbound queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub delivered: usize,
    pub remaining: usize,
}

pub struct TransmissionDispatcher {
    backend: Arc<dyn TransmissionBackend>,
    queue: Arc<OutboundQueue>,
    ledger: Arc<IncidentLedger>,
    telemetry: TelemetryWatch,
    policy: DispatchPolicy,
}

impl TransmissionDispatcher {
    pub fn new(
        backend: Arc<dyn TransmissionBackend>,
        queue: Arc<OutboundQueue>,
        ledger: Arc<IncidentLedger>,
        telemetry: TelemetryWatch,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            backend,
            queue,
            ledger,
            telemetry,
            policy,
        }
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    fn record(&self, incident_id: &str, action: &str, outcome: LogOutcome, message: &str, data: Option<Value>) {
        match self.ledger.log_action(incident_id, action, outcome, message, data) {
            Ok(()) => {}
            // Replayed incidents may already have been pruned from the ledger.
            Err(LedgerError::NotFound(_)) => {
                tracing::debug!("dispatch: {} not in ledger, {} not recorded", incident_id, action)
            }
            Err(e) => tracing::warn!("dispatch: failed to record {} for {}: {}", action, incident_id, e),
        }
    }

    /// Deliver `incident_id`, falling back to the outbound queue.
    pub async fn dispatch(&self, incident_id: &str) -> DispatchOutcome {
        let incident = match self.ledger.get_incident(incident_id) {
            Some(i) => i,
            None => {
                return DispatchOutcome::Failed {
                    attempts: 0,
                    reason: format!("incident {} not found", incident_id),
                }
            }
        };
        let payload = TransmissionPayload::from(&incident);

        let (attempts, reason) = if self.telemetry.is_online() {
            match self.deliver(&payload).await {
                Ok(attempt) => {
                    self.clear_queued(incident_id);
                    return DispatchOutcome::Delivered { attempts: attempt };
                }
                Err(failure) => failure,
            }
        } else {
            tracing::info!("dispatch: device offline, skipping online delivery of {}", incident_id);
            (0, "device offline".to_string())
        };

        self.fall_back_offline(payload, attempts, reason)
    }

    /// Up to `max_attempts` transmissions. `Ok(attempt)` on success,
    /// `Err((attempts_made, last_error))` otherwise.
    async fn deliver(&self, payload: &TransmissionPayload) -> Result<u32, (u32, String)> {
        let id = payload.incident_id.as_str();
        let max = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max {
            match self.backend.transmit(payload).await {
                Ok(()) => {
                    tracing::info!("dispatch: {} delivered via {} (attempt {})", id, self.backend.name(), attempt);
                    self.record(
                        id,
                        actions::TRANSMISSION_SUCCESS,
                        LogOutcome::Success,
                        &format!("delivered via {}", self.backend.name()),
                        Some(json!({ "attempt": attempt, "backend": self.backend.name() })),
                    );
                    return Ok(attempt);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    tracing::warn!("dispatch: attempt {}/{} for {} failed: {}", attempt, max, id, last_error);
                    self.record(
                        id,
                        actions::TRANSMISSION_FAILED,
                        LogOutcome::Error,
                        &format!("attempt {}/{} failed", attempt, max),
                        Some(json!({ "attempt": attempt, "error": last_error })),
                    );
                    if attempt < max {
                        if !self.telemetry.is_online() {
                            return Err((attempt, last_error));
                        }
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }
        Err((max, last_error))
    }

    fn fall_back_offline(&self, payload: TransmissionPayload, attempts: u32, reason: String) -> DispatchOutcome {
        let id = payload.incident_id.clone();
        if !self.policy.offline_queue {
            tracing::error!("dispatch: {} not delivered and offline queue disabled: {}", id, reason);
            return DispatchOutcome::Failed { attempts, reason };
        }

        let message = QueuedMessage::new(payload);
        let code = message.compact_code.clone();
        match self.queue.enqueue(message) {
            Ok(len) => {
                tracing::warn!("dispatch: {} queued for offline transmission ({} queued)", id, len);
                self.record(
                    &id,
                    actions::OFFLINE_MODE_ACTIVATED,
                    LogOutcome::Warning,
                    "incident queued for offline transmission",
                    Some(json!({ "queue_length": len, "compact_code": code, "reason": reason })),
                );
                DispatchOutcome::Queued { attempts }
            }
            Err(e) => {
                tracing::error!("dispatch: failed to queue {}: {}", id, e);
                self.record(
                    &id,
                    actions::QUEUE_WRITE_FAILED,
                    LogOutcome::Error,
                    &format!("could not queue incident: {}", e),
                    None,
                );
                DispatchOutcome::Failed {
                    attempts,
                    reason: format!("{}; queue write failed: {}", reason, e),
                }
            }
        }
    }

    /// Persist the incident snapshot ahead of transmission. Removed again once
    /// a delivery of the same incident succeeds.
    pub fn store_snapshot(&self, incident: &Incident) -> Result<(), QueueError> {
        self.queue.store_pending(&TransmissionPayload::from(incident))
    }

    fn clear_queued(&self, incident_id: &str) {
        if let Err(e) = self.queue.clear_pending(incident_id) {
            tracing::warn!("dispatch: failed to clear pending snapshot of {}: {}", incident_id, e);
        }
        match self.queue.remove(incident_id) {
            Ok(true) => self.record(
                incident_id,
                actions::QUEUE_CLEARED,
                LogOutcome::Success,
                "queued copy removed after successful delivery",
                None,
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!("dispatch: failed to clear queued copy of {}: {}", incident_id, e),
        }
    }

    /// Retry every queued incident through the online path. Incidents that
    /// still fail stay queued.
    pub async fn replay(&self) -> Result<ReplayReport, QueueError> {
        let queued = self.queue.list()?;
        if !self.telemetry.is_online() {
            return Ok(ReplayReport {
                delivered: 0,
                remaining: queued.len(),
            });
        }

        let mut report = ReplayReport::default();
        for message in queued {
            match self.deliver(&message.payload).await {
                Ok(_) => {
                    self.clear_queued(&message.incident_id);
                    report.delivered += 1;
                }
                Err(_) => report.remaining += 1,
            }
        }
        tracing::info!("dispatch: replay delivered {}, {} still queued", report.delivered, report.remaining);
        Ok(report)
    }
}

/// Replay the queue every time connectivity comes back.
pub fn spawn_reconnect_replay(dispatcher: Arc<TransmissionDispatcher>, mut telemetry: TelemetryWatch) -> JoinHandle<()> {
    let mut was_online = telemetry.is_online();
    tokio::spawn(async move {
        while telemetry.changed().await {
            let online = telemetry.is_online();
            if online && !was_online {
                if let Err(e) = dispatcher.replay().await {
                    tracing::warn!("dispatch: replay after reconnect failed: {}", e);
                }
            }
            was_online = online;
        }
    })
}
