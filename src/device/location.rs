// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Location providers.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::incident::Location;

/// Source of a current position fix.
///
/// Implementations should give up after `timeout`; the controller also enforces
/// it, so a provider that hangs only costs the timeout.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self, timeout: Duration) -> Option<Location>;
}

/// Always reports the same fix.
pub struct StaticLocation {
    location: Location,
}

impl StaticLocation {
    pub fn new(location: Location) -> Self {
        Self { location }
    }
}

#[async_trait]
impl LocationProvider for StaticLocation {
    async fn current_location(&self, _timeout: Duration) -> Option<Location> {
        Some(self.location.clone())
    }
}

/// No positioning available (permission denied, no hardware).
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_location(&self, _timeout: Duration) -> Option<Location> {
        None
    }
}
