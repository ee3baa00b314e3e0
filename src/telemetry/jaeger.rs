// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Jaeger JSON projection of finished spans.
//!
//! Timestamps are microseconds since the Unix epoch. Tags follow the span's
//! attribute key order, so identical span state always serializes to identical
//! bytes.

use serde::{Deserialize, Serialize};

use super::span::{AttributeValue, SpanData, StatusCode};

/// Jaeger tag value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaegerTag {
    pub key: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub value: String,
}

impl JaegerTag {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tag_type: TagType::String,
            value: value.into(),
        }
    }

    fn from_attribute(key: &str, value: &AttributeValue) -> Self {
        Self {
            key: key.to_string(),
            tag_type: if value.is_numeric() {
                TagType::Number
            } else {
                TagType::String
            },
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaegerField {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaegerLog {
    pub timestamp: u64,
    pub fields: Vec<JaegerField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JaegerProcess {
    pub service_name: String,
    pub tags: Vec<JaegerTag>,
}

/// One span in the Jaeger JSON ingestion format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JaegerSpan {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    #[serde(rename = "parentSpanID", skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_time: u64,
    pub duration: u64,
    pub tags: Vec<JaegerTag>,
    pub logs: Vec<JaegerLog>,
    pub process: JaegerProcess,
}

impl JaegerSpan {
    /// Build the projection. Unended spans report a zero duration.
    pub fn from_span(span: &SpanData, service_name: &str) -> Self {
        let ctx = span.context();

        let mut tags: Vec<JaegerTag> = span
            .attributes()
            .iter()
            .map(|(key, value)| JaegerTag::from_attribute(key, value))
            .collect();
        tags.push(JaegerTag::string("span.kind", span.kind().as_str()));
        let status = span.status();
        if status.code != StatusCode::Unset {
            tags.push(JaegerTag::string("otel.status_code", status.code.as_str()));
        }
        if let Some(ref message) = status.message {
            tags.push(JaegerTag::string("otel.status_description", message.clone()));
        }

        let logs = span
            .events()
            .iter()
            .map(|event| {
                let mut fields = vec![JaegerField {
                    key: "event".to_string(),
                    value: event.name.clone(),
                }];
                fields.extend(event.attributes.iter().map(|(key, value)| JaegerField {
                    key: key.clone(),
                    value: value.to_string(),
                }));
                JaegerLog {
                    timestamp: event.timestamp,
                    fields,
                }
            })
            .collect();

        Self {
            trace_id: ctx.trace_id.to_string(),
            span_id: ctx.span_id.to_string(),
            parent_span_id: ctx.parent_span_id.map(|id| id.to_string()),
            operation_name: span.name().to_string(),
            start_time: span.start_time(),
            duration: span.duration_micros().unwrap_or(0),
            tags,
            logs,
            process: JaegerProcess {
                service_name: service_name.to_string(),
                tags: Vec::new(),
            },
        }
    }

    pub fn tag(&self, key: &str) -> Option<&JaegerTag> {
        self.tags.iter().find(|tag| tag.key == key)
    }
}

/// Request body for `POST {endpoint}/api/traces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaegerBatch {
    pub data: Vec<JaegerSpan>,
}

impl JaegerBatch {
    pub fn new(data: Vec<JaegerSpan>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
