// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Best-effort notification channels.
//!
//! The controller announces protocol start, completion and cancellation to
//! every available channel. Sends are fire-and-forget: a failing channel is
//! logged and never affects the protocol.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod local;
pub mod webhook;

use crate::core::alerts::Severity;

/// One notification message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    /// Incident the notification is about, if any.
    pub incident_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, title: String, body: String, incident_id: Option<String>) -> Self {
        Self {
            severity,
            title,
            body,
            incident_id,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    async fn send_notification(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Registered channels.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.push(channel);
    }

    /// Channels currently able to deliver.
    pub fn available(&self) -> impl Iterator<Item = &Arc<dyn NotificationChannel>> {
        self.channels.iter().filter(|c| c.is_available())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Fan a notification out to every available channel without waiting.
    pub fn broadcast(&self, notification: Notification) {
        for ch in self.available() {
            let ch: Arc<dyn NotificationChannel> = Arc::clone(ch);
            let n = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = ch.send_notification(&n).await {
                    tracing::warn!("notify: failed to send to {}: {}", ch.name(), e);
                }
            });
        }
    }
}
