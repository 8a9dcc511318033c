// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! SOS Guard: a guarded, multi-step emergency activation protocol.
//!
//! An activation walks through four confirmations under a per-step countdown
//! and a session ceiling, then becomes irrevocable and is transmitted (or
//! queued for later when the device is offline). Every step and action is
//! recorded in an append-only incident ledger.

pub mod config;
pub mod core;
pub mod device;
pub mod dispatch;
pub mod ledger;
pub mod notify;
pub mod protocol;
