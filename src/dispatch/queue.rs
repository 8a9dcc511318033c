// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Durable outbound queue for incidents that could not be delivered online.
//!
//! Messages are keyed by incident id: queueing the same incident again replaces
//! the earlier copy. An external consumer (a satellite or SMS uplink) empties
//! the queue with [`OutboundQueue::drain`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TransmissionPayload;
use crate::ledger::store::{KeyValueStore, StoreError};

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "satellite_emergency_queue";

/// Store key holding the snapshot of the incident currently being delivered.
pub const PENDING_KEY: &str = "pending_emergency_data";

/// Message kind understood by the uplink.
pub const EMERGENCY_SOS: &str = "EMERGENCY_SOS";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("stored queue is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("failed to serialize queue: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to persist queue: {0}")]
    Store(#[from] StoreError),
}

/// One queued emergency broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub incident_id: String,
    /// Always [`EMERGENCY_SOS`].
    pub kind: String,
    /// Short human-readable text for low-bandwidth links.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact_code: Option<String>,
    pub payload: TransmissionPayload,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(payload: TransmissionPayload) -> Self {
        let compact_code = payload
            .location
            .as_ref()
            .and_then(|l| l.compact_code.clone());
        let message = match &compact_code {
            Some(code) => format!("EMERGENCY SOS at {} - assistance required", code),
            None => "EMERGENCY SOS - location unknown - assistance required".to_string(),
        };
        Self {
            incident_id: payload.incident_id.clone(),
            kind: EMERGENCY_SOS.to_string(),
            message,
            compact_code,
            payload,
            queued_at: Utc::now(),
        }
    }
}

pub struct OutboundQueue {
    store: Arc<dyn KeyValueStore>,
    guard: Mutex<()>,
}

impl OutboundQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        match self.store.get(QUEUE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(QueueError::Corrupt),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, messages: &[QueuedMessage]) -> Result<(), QueueError> {
        if messages.is_empty() {
            self.store.remove(QUEUE_KEY)?;
            return Ok(());
        }
        let bytes = serde_json::to_vec(messages).map_err(QueueError::Serialize)?;
        self.store.put(QUEUE_KEY, &bytes)?;
        Ok(())
    }

    /// Add or replace the message for its incident. Returns the queue length.
    pub fn enqueue(&self, message: QueuedMessage) -> Result<usize, QueueError> {
        let _g = self.guard.lock().unwrap();
        let mut messages = self.load()?;
        match messages.iter_mut().find(|m| m.incident_id == message.incident_id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        self.save(&messages)?;
        Ok(messages.len())
    }

    /// Remove the message for `incident_id`. Returns whether one was queued.
    pub fn remove(&self, incident_id: &str) -> Result<bool, QueueError> {
        let _g = self.guard.lock().unwrap();
        let mut messages = self.load()?;
        let before = messages.len();
        messages.retain(|m| m.incident_id != incident_id);
        if messages.len() == before {
            return Ok(false);
        }
        self.save(&messages)?;
        Ok(true)
    }

    pub fn contains(&self, incident_id: &str) -> Result<bool, QueueError> {
        let _g = self.guard.lock().unwrap();
        Ok(self.load()?.iter().any(|m| m.incident_id == incident_id))
    }

    /// Queued messages, oldest first.
    pub fn list(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        let _g = self.guard.lock().unwrap();
        self.load()
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.list()?.len())
    }

    /// Store the snapshot of the incident about to be transmitted. It stays
    /// until [`clear_pending`](Self::clear_pending) is called for the same
    /// incident after a successful delivery.
    pub fn store_pending(&self, payload: &TransmissionPayload) -> Result<(), QueueError> {
        let _g = self.guard.lock().unwrap();
        let bytes = serde_json::to_vec(payload).map_err(QueueError::Serialize)?;
        self.store.put(PENDING_KEY, &bytes)?;
        Ok(())
    }

    fn load_pending(&self) -> Result<Option<TransmissionPayload>, QueueError> {
        match self.store.get(PENDING_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(QueueError::Corrupt),
            None => Ok(None),
        }
    }

    pub fn pending(&self) -> Result<Option<TransmissionPayload>, QueueError> {
        let _g = self.guard.lock().unwrap();
        self.load_pending()
    }

    /// Drop the pending snapshot if it belongs to `incident_id`.
    pub fn clear_pending(&self, incident_id: &str) -> Result<bool, QueueError> {
        let _g = self.guard.lock().unwrap();
        let matches = self
            .load_pending()?
            .map(|p| p.incident_id == incident_id)
            .unwrap_or(false);
        if matches {
            self.store.remove(PENDING_KEY)?;
        }
        Ok(matches)
    }

    /// Take every queued message, leaving the queue empty.
    pub fn drain(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        let _g = self.guard.lock().unwrap();
        let messages = self.load()?;
        if !messages.is_empty() {
            self.save(&[])?;
        }
        Ok(messages)
    }
}
