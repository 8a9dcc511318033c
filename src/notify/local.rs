// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! On-device notification channel.
//!
//! Forwards notifications over a tokio mpsc channel to whatever local surface
//! renders them (a status bar, the operator CLI). If the receiving side has
//! gone away the channel reports itself unavailable and sends succeed silently.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Notification, NotificationChannel};

pub struct LocalChannel {
    tx: mpsc::Sender<Notification>,
}

impl LocalChannel {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationChannel for LocalChannel {
    fn name(&self) -> &str {
        "local"
    }

    fn is_available(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        let _ = self.tx.send(notification.clone()).await;
        Ok(())
    }
}
