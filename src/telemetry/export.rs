// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Export sinks for finished spans.
//!
//! Delivery is at-most-once: a failed export is reported to the caller (the
//! telemetry system), which logs it and drops the batch.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, info};

use crate::error::TelemetryError;

use super::jaeger::{JaegerBatch, JaegerSpan};
use super::lock;

/// A destination for batches of finished spans.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Short sink name for diagnostics.
    fn name(&self) -> &str;

    /// Deliver one batch.
    async fn export(&self, batch: &JaegerBatch) -> Result<(), TelemetryError>;
}

/// Posts batches to a Jaeger collector's HTTP JSON endpoint.
pub struct JaegerHttpExporter {
    client: Client,
    endpoint: String,
}

impl JaegerHttpExporter {
    /// Create an exporter for a collector base URL (without `/api/traces`).
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, TelemetryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(endpoint, client))
    }

    pub fn with_client(endpoint: &str, client: Client) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn traces_url(&self) -> String {
        format!("{}/api/traces", self.endpoint)
    }
}

#[async_trait]
impl SpanExporter for JaegerHttpExporter {
    fn name(&self) -> &str {
        "jaeger"
    }

    async fn export(&self, batch: &JaegerBatch) -> Result<(), TelemetryError> {
        let body = serde_json::to_vec(batch)?;
        let response = self
            .client
            .post(self.traces_url())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::ExportStatus {
                status: status.as_u16(),
                body,
            });
        }

        debug!(spans = batch.len(), url = %self.traces_url(), "Delivered trace batch");
        Ok(())
    }
}

/// Writes a one-line summary of each batch to the diagnostic log.
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl SpanExporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn export(&self, batch: &JaegerBatch) -> Result<(), TelemetryError> {
        info!("Exported {} traces", batch.len());
        Ok(())
    }
}

/// Keeps exported spans in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    batches: Mutex<Vec<Vec<JaegerSpan>>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All spans exported so far, in export order.
    pub fn spans(&self) -> Vec<JaegerSpan> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        lock(&self.batches).len()
    }

    pub fn clear(&self) {
        lock(&self.batches).clear();
    }
}

#[async_trait]
impl SpanExporter for MemoryExporter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn export(&self, batch: &JaegerBatch) -> Result<(), TelemetryError> {
        lock(&self.batches).push(batch.data.clone());
        Ok(())
    }
}
