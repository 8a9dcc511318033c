// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Guarded emergency activation protocol.
//!
//! [`fsm`] holds the pure transition rules, [`governor`] the two safety
//! timers, [`controller`] ties them to the ledger and dispatcher, and
//! [`runner`] puts the controller on its own task behind a handle.

pub mod controller;
pub mod error;
pub mod fsm;
pub mod governor;
pub mod runner;

pub use controller::{ActivationController, ActivationHandle, ControllerSnapshot, Transition};
pub use error::{ProtocolError, ProtocolWarning};
pub use fsm::{CancelReason, ProtocolState};
pub use runner::{spawn_controller, ControllerHandle};
