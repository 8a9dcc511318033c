// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Battery and connectivity feed.
//!
//! The platform layer pushes updates into a [`TelemetryFeed`]; the controller
//! and dispatcher hold [`TelemetryWatch`] handles and read the latest value
//! whenever they need it. Telemetry is context only and never drives a
//! protocol transition.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTelemetry {
    /// Percent, 0-100.
    pub battery_level: u8,
    pub connectivity: Connectivity,
    pub device_info: String,
}

impl Default for DeviceTelemetry {
    fn default() -> Self {
        Self {
            battery_level: 100,
            connectivity: Connectivity::Online,
            device_info: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Writer side of the telemetry feed.
pub struct TelemetryFeed {
    tx: watch::Sender<DeviceTelemetry>,
}

impl TelemetryFeed {
    pub fn new(initial: DeviceTelemetry) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> TelemetryWatch {
        TelemetryWatch {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> DeviceTelemetry {
        self.tx.borrow().clone()
    }

    pub fn set_battery(&self, level: u8) {
        let level = level.min(100);
        self.tx.send_if_modified(|t| {
            let changed = t.battery_level != level;
            t.battery_level = level;
            changed
        });
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        let changed = self.tx.send_if_modified(|t| {
            let changed = t.connectivity != connectivity;
            t.connectivity = connectivity;
            changed
        });
        if changed {
            tracing::info!("telemetry: connectivity now {:?}", connectivity);
        }
    }
}

impl Default for TelemetryFeed {
    fn default() -> Self {
        Self::new(DeviceTelemetry::default())
    }
}

/// Reader side of the telemetry feed.
#[derive(Clone)]
pub struct TelemetryWatch {
    rx: watch::Receiver<DeviceTelemetry>,
}

impl TelemetryWatch {
    /// A watch that never changes. Useful when no platform feed exists.
    pub fn fixed(telemetry: DeviceTelemetry) -> Self {
        let (tx, rx) = watch::channel(telemetry);
        // Dropping the sender keeps the last value readable.
        drop(tx);
        Self { rx }
    }

    pub fn snapshot(&self) -> DeviceTelemetry {
        self.rx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.rx.borrow().connectivity == Connectivity::Online
    }

    /// Wait for the next update. Returns `false` once the feed is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
