// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Device-side collaborators: location fixes, the contact directory and the
//! battery/connectivity feed. All are injected into the controller.

pub mod contacts;
pub mod location;
pub mod telemetry;

pub use contacts::{ContactDirectory, StaticDirectory};
pub use location::{LocationProvider, NoLocation, StaticLocation};
pub use telemetry::{Connectivity, DeviceTelemetry, TelemetryFeed, TelemetryWatch};
