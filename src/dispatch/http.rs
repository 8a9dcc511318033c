// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! HTTP transmission backend.
//!
//! Posts the incident payload as JSON to the configured endpoint, failing over
//! to the backup endpoint once. When a signing secret is configured the request
//! carries:
//!
//! - `X-SOS-Timestamp`: unix seconds
//! - `X-SOS-Signature`: `v0=` + hex HMAC-SHA256 over `v0:{timestamp}:{body}`
//!
//! Receivers check it with [`verify_signature`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{TransmissionBackend, TransmissionPayload};
use crate::config::TransmissionConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-SOS-Signature";
pub const TIMESTAMP_HEADER: &str = "X-SOS-Timestamp";

pub struct HttpBackend {
    endpoint: String,
    backup_endpoint: String,
    signing_secret: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &TransmissionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            backup_endpoint: config.backup_endpoint.clone(),
            signing_secret: config.signing_secret.clone(),
            client,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    async fn post(&self, url: &str, body: &[u8], timestamp: &str) -> anyhow::Result<()> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if !self.signing_secret.is_empty() {
            let signature = sign_payload(&self.signing_secret, timestamp, body)?;
            request = request
                .header(TIMESTAMP_HEADER, timestamp)
                .header(SIGNATURE_HEADER, signature);
        }
        let resp = request.send().await.with_context(|| format!("POST {} failed", url))?;
        if !resp.status().is_success() {
            anyhow::bail!("{} returned {}", url, resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl TransmissionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn transmit(&self, payload: &TransmissionPayload) -> anyhow::Result<()> {
        if !self.is_configured() {
            anyhow::bail!("no transmission endpoint configured");
        }
        let body = serde_json::to_vec(payload).context("Failed to serialize payload")?;
        let timestamp = Utc::now().timestamp().to_string();

        match self.post(&self.endpoint, &body, &timestamp).await {
            Ok(()) => Ok(()),
            Err(primary) if !self.backup_endpoint.is_empty() => {
                tracing::warn!("http: primary endpoint failed ({:#}), trying backup", primary);
                self.post(&self.backup_endpoint, &body, &timestamp).await
            }
            Err(primary) => Err(primary),
        }
    }
}

/// `v0=` + hex HMAC-SHA256 of `v0:{timestamp}:{body}`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid signing key: {}", e))?;
    mac.update(format!("v0:{}:", timestamp).as_bytes());
    mac.update(body);
    Ok(format!("v0={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature produced by [`sign_payload`].
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let hex_part = match signature.strip_prefix("v0=") {
        Some(h) => h,
        None => return false,
    };
    let expected = match hex::decode(hex_part) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(format!("v0:{}:", timestamp).as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
