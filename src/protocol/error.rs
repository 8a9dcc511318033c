// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Protocol failure taxonomy.
//!
//! [`ProtocolError`] is returned when an operation is refused and no transition
//! happened. [`ProtocolWarning`] rides along on a successful transition for
//! conditions that degrade the flow without stopping it.

use std::fmt;

use super::fsm::ProtocolState;

/// An operation the protocol refused. The FSM state is unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{attempted} is not valid in state {state}")]
    StateMismatch {
        state: ProtocolState,
        attempted: String,
    },
    #[error("incident can no longer be cancelled (state {state})")]
    NotCancellable { state: ProtocolState },
    #[error("no active incident")]
    NoActiveIncident,
    #[error("transmission failed after {attempts} attempt(s): {reason}")]
    TransmissionFailure { attempts: u32, reason: String },
    #[error("activation controller is not running")]
    ControllerStopped,
}

/// A non-fatal condition reported alongside a completed transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolWarning {
    /// Location could not be acquired; the step proceeded with no payload.
    LocationUnavailable,
    /// The ledger rejected or failed to persist a write.
    StorageWriteFailure(String),
}

impl fmt::Display for ProtocolWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolWarning::LocationUnavailable => write!(f, "location unavailable"),
            ProtocolWarning::StorageWriteFailure(e) => write!(f, "storage write failure: {}", e),
        }
    }
}
