// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Incoming-webhook notification channel.
//!
//! Posts a color-coded attachment message (the format accepted by Slack and
//! Mattermost incoming webhooks). If the primary URL fails, the backup URL is
//! tried once.

use async_trait::async_trait;
use serde_json::json;

use super::{Notification, NotificationChannel};
use crate::config::WebhookConfig;
use crate::core::alerts::Severity;

pub struct WebhookChannel {
    url: String,
    backup_url: String,
    enabled: bool,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            backup_url: config.backup_url.clone(),
            enabled: config.is_enabled(),
            client: reqwest::Client::new(),
        }
    }

    /// Post to the primary URL, failing over to the backup.
    async fn post_webhook(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let resp = self.client.post(&self.url).json(payload).send().await;

        match resp {
            Ok(r) if r.status().is_success() => Ok(()),
            _ => {
                if !self.backup_url.is_empty() {
                    let r = self.client.post(&self.backup_url).json(payload).send().await?;
                    if !r.status().is_success() {
                        anyhow::bail!("backup webhook returned {}", r.status());
                    }
                    Ok(())
                } else if let Err(e) = resp {
                    Err(e.into())
                } else {
                    anyhow::bail!("primary webhook failed, no backup configured")
                }
            }
        }
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "#36a64f",
        Severity::Warning => "#daa520",
        Severity::Critical => "#dc3545",
    }
}

fn build_payload(notification: &Notification) -> serde_json::Value {
    json!({
        "username": "SOS Guard",
        "icon_emoji": ":rotating_light:",
        "attachments": [{
            "color": severity_color(notification.severity),
            "title": format!("{} {}", notification.severity.emoji(), notification.title),
            "text": notification.body,
            "ts": notification.at.timestamp(),
            "fields": [
                { "title": "Severity", "value": notification.severity.to_string(), "short": true },
                { "title": "Incident", "value": notification.incident_id.as_deref().unwrap_or("-"), "short": true },
            ],
        }]
    })
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn is_available(&self) -> bool {
        self.enabled && !self.url.is_empty()
    }

    async fn send_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        if !self.is_available() {
            return Ok(());
        }
        self.post_webhook(&build_payload(notification)).await
    }
}
