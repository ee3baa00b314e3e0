// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spans: timed, attributed records of one unit of traced work.
//!
//! [`SpanData`] is the plain record. [`Span`] is the cheap, cloneable handle
//! application code and the telemetry system share while the span is active.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock;
use super::context::{SpanId, TraceContext, TraceId};
use super::jaeger::JaegerSpan;
use super::lock;

/// A span attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl AttributeValue {
    /// Whether the value is a scalar number.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => f.write_str(s),
            Self::BoolArray(items) => f.write_str(&join(items)),
            Self::IntArray(items) => f.write_str(&join(items)),
            Self::FloatArray(items) => f.write_str(&join(items)),
            Self::StringArray(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for AttributeValue {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<bool>> for AttributeValue {
    fn from(value: Vec<bool>) -> Self {
        Self::BoolArray(value)
    }
}

impl From<Vec<i64>> for AttributeValue {
    fn from(value: Vec<i64>) -> Self {
        Self::IntArray(value)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(value: Vec<f64>) -> Self {
        Self::FloatArray(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringArray(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        Self::StringArray(value.into_iter().map(String::from).collect())
    }
}

/// Ordered attribute map; key order keeps exports deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Build an attribute list from `key => value` pairs.
///
/// # Example
///
/// ```rust,ignore
/// span.add_event_with("cache_miss", attributes! { "cache.key" => key, "cache.size" => 12 });
/// ```
#[macro_export]
macro_rules! attributes {
    () => {
        ::std::vec::Vec::<(::std::string::String, $crate::telemetry::AttributeValue)>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$((
            ::std::string::String::from($key),
            $crate::telemetry::AttributeValue::from($value),
        )),+]
    };
}

/// Role of a span in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Server => "server",
            Self::Client => "client",
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code == StatusCode::Error
    }
}

/// A timestamped point of interest within a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEvent {
    pub name: String,
    /// Microseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// A weak reference to a span in this or another trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// Sensitivity of protected health information touched by a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhiDataLevel {
    #[default]
    None,
    Limited,
    Full,
}

impl PhiDataLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Limited => "limited",
            Self::Full => "full",
        }
    }
}

const HEALTHCARE_ATTRIBUTE_PREFIX: &str = "healthcare.";

/// Healthcare annotations fixed when a span is created.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcareContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinical_workflow_id: Option<String>,
    pub phi_data_level: PhiDataLevel,
    #[serde(default)]
    pub compliance_flags: BTreeSet<String>,
    #[serde(default)]
    pub emergency_context: bool,
    #[serde(default)]
    pub clinical_decision_point: bool,
}

impl HealthcareContext {
    pub fn new(phi_data_level: PhiDataLevel) -> Self {
        Self {
            phi_data_level,
            ..Self::default()
        }
    }

    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_encounter(mut self, encounter_id: impl Into<String>) -> Self {
        self.encounter_id = Some(encounter_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.clinical_workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.compliance_flags.insert(flag.into());
        self
    }

    pub fn emergency(mut self) -> Self {
        self.emergency_context = true;
        self
    }

    pub fn decision_point(mut self) -> Self {
        self.clinical_decision_point = true;
        self
    }

    fn seed_attributes(&self, attributes: &mut Attributes) {
        attributes.insert(
            "healthcare.phi_level".to_string(),
            self.phi_data_level.as_str().into(),
        );
        attributes.insert(
            "healthcare.compliance_flags".to_string(),
            self.compliance_flags
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
                .into(),
        );
        if self.emergency_context {
            attributes.insert("healthcare.emergency".to_string(), true.into());
        }
    }
}

/// The recorded state of one span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanData {
    name: String,
    context: TraceContext,
    kind: SpanKind,
    /// Microseconds since the Unix epoch
    start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<u64>,
    status: SpanStatus,
    attributes: Attributes,
    events: Vec<SpanEvent>,
    links: Vec<SpanLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcare_context: Option<HealthcareContext>,
}

impl SpanData {
    /// Start a span now.
    ///
    /// Healthcare annotations, when present, are copied into attributes here
    /// and only here.
    pub fn new(
        name: impl Into<String>,
        context: TraceContext,
        kind: SpanKind,
        healthcare_context: Option<HealthcareContext>,
    ) -> Self {
        let mut attributes = Attributes::new();
        if let Some(ref hc) = healthcare_context {
            hc.seed_attributes(&mut attributes);
        }

        Self {
            name: name.into(),
            context,
            kind,
            start_time: clock::now_micros(),
            end_time: None,
            status: SpanStatus::default(),
            attributes,
            events: Vec::new(),
            links: Vec::new(),
            healthcare_context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn end_time(&self) -> Option<u64> {
        self.end_time
    }

    pub fn status(&self) -> &SpanStatus {
        &self.status
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }

    pub fn links(&self) -> &[SpanLink] {
        &self.links
    }

    pub fn healthcare_context(&self) -> Option<&HealthcareContext> {
        self.healthcare_context.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Elapsed microseconds, once ended.
    pub fn duration_micros(&self) -> Option<u64> {
        self.end_time
            .map(|end| end.saturating_sub(self.start_time))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_micros().map(Duration::from_micros)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if self.is_ended() {
            debug!(span = %self.name, "Ignoring attribute set on ended span");
            return;
        }
        self.insert_attribute(key.into(), value.into());
    }

    pub fn set_attributes<I, K, V>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        if self.is_ended() {
            debug!(span = %self.name, "Ignoring attributes set on ended span");
            return;
        }
        self.merge_attributes(attributes);
    }

    /// Merge attributes regardless of whether the span has ended.
    pub(crate) fn merge_attributes<I, K, V>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        for (key, value) in attributes {
            self.insert_attribute(key.into(), value.into());
        }
    }

    /// Healthcare annotations are fixed at creation; later writes to their
    /// `healthcare.*` keys are dropped.
    fn insert_attribute(&mut self, key: String, value: AttributeValue) {
        if self.healthcare_context.is_some() && key.starts_with(HEALTHCARE_ATTRIBUTE_PREFIX) {
            debug!(span = %self.name, key = %key, "Ignoring write to healthcare attribute");
            return;
        }
        self.attributes.insert(key, value);
    }

    pub fn add_event(&mut self, name: impl Into<String>) {
        self.add_event_with(name, Vec::<(String, AttributeValue)>::new());
    }

    /// Append an event stamped with the current time.
    ///
    /// Events after `end()` are still recorded.
    pub fn add_event_with<I, K, V>(&mut self, name: impl Into<String>, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let name = name.into();
        if self.is_ended() {
            debug!(span = %self.name, event = %name, "Recording event on ended span");
        }
        self.events.push(SpanEvent {
            name,
            timestamp: clock::now_micros(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
    }

    pub fn add_link<I, K, V>(&mut self, target: &TraceContext, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.links.push(SpanLink {
            trace_id: target.trace_id,
            span_id: target.span_id,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
    }

    /// Overwrites any previous status.
    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    /// Add an `exception` event and mark the span as failed.
    pub fn record_exception(
        &mut self,
        exception_type: &str,
        message: &str,
        stacktrace: Option<&str>,
    ) {
        let mut attrs: Vec<(String, AttributeValue)> = vec![
            ("exception.type".to_string(), exception_type.into()),
            ("exception.message".to_string(), message.into()),
        ];
        if let Some(trace) = stacktrace {
            attrs.push(("exception.stacktrace".to_string(), trace.into()));
        }
        self.add_event_with("exception", attrs);
        self.set_status(SpanStatus::error(message));
    }

    /// Record a Rust error value as an exception.
    pub fn record_error<E>(&mut self, err: &E)
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        let message = err.to_string();
        let stacktrace = format!("{:?}", err);
        self.record_exception(std::any::type_name::<E>(), &message, Some(&stacktrace));
    }

    /// Mark the span finished. The first call wins.
    pub fn end(&mut self) {
        self.end_at(clock::now_micros());
    }

    pub(crate) fn end_at(&mut self, timestamp: u64) {
        if self.is_ended() {
            debug!(span = %self.name, "Span already ended; keeping first end time");
            return;
        }
        self.end_time = Some(timestamp.max(self.start_time));
    }

    /// Audit an access to protected health information.
    pub fn record_phi_access(
        &mut self,
        data_type: &str,
        access_reason: &str,
        user_id: Option<&str>,
    ) {
        let mut attrs: Vec<(String, AttributeValue)> = vec![
            ("phi.data_type".to_string(), data_type.into()),
            ("phi.access_reason".to_string(), access_reason.into()),
            (
                "phi.accessed_at".to_string(),
                chrono::Utc::now().to_rfc3339().into(),
            ),
        ];
        if let Some(user) = user_id {
            attrs.push(("phi.user_id".to_string(), user.into()));
        }
        self.add_event_with("phi_access", attrs);
    }

    pub fn record_clinical_decision(
        &mut self,
        decision_type: &str,
        outcome: &str,
        confidence: Option<f64>,
    ) {
        let mut attrs: Vec<(String, AttributeValue)> = vec![
            ("clinical.decision_type".to_string(), decision_type.into()),
            ("clinical.outcome".to_string(), outcome.into()),
        ];
        if let Some(confidence) = confidence {
            attrs.push(("clinical.confidence".to_string(), confidence.into()));
        }
        self.add_event_with("clinical_decision", attrs);
    }

    pub fn record_compliance_checkpoint(
        &mut self,
        checkpoint: &str,
        passed: bool,
        details: Option<&str>,
    ) {
        let mut attrs: Vec<(String, AttributeValue)> = vec![
            ("compliance.checkpoint".to_string(), checkpoint.into()),
            ("compliance.passed".to_string(), passed.into()),
        ];
        if let Some(details) = details {
            attrs.push(("compliance.details".to_string(), details.into()));
        }
        self.add_event_with("compliance_checkpoint", attrs);
    }

    /// Project into the Jaeger JSON shape. Pure.
    pub fn to_jaeger_format(&self, service_name: &str) -> JaegerSpan {
        JaegerSpan::from_span(self, service_name)
    }
}

/// Shared handle to a span.
///
/// Clones refer to the same underlying record.
#[derive(Clone)]
pub struct Span {
    inner: Arc<Mutex<SpanData>>,
    context: TraceContext,
    recording: bool,
}

impl Span {
    pub(crate) fn from_data(data: SpanData, recording: bool) -> Self {
        let context = data.context.clone();
        Self {
            inner: Arc::new(Mutex::new(data)),
            context,
            recording,
        }
    }

    /// A standalone span that no telemetry system will export.
    pub fn detached(
        name: impl Into<String>,
        context: TraceContext,
        kind: SpanKind,
        healthcare_context: Option<HealthcareContext>,
    ) -> Self {
        Self::from_data(SpanData::new(name, context, kind, healthcare_context), false)
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.context.span_id
    }

    /// Whether the span was sampled and will be exported once finished.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether both handles refer to the same span.
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run a closure against the span record.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut SpanData) -> R) -> R {
        let mut data = lock(&self.inner);
        f(&mut data)
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> SpanData {
        lock(&self.inner).clone()
    }

    pub fn name(&self) -> String {
        self.with_data(|d| d.name.clone())
    }

    pub fn status(&self) -> SpanStatus {
        self.with_data(|d| d.status.clone())
    }

    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        self.with_data(|d| d.attribute(key).cloned())
    }

    pub fn is_ended(&self) -> bool {
        self.with_data(|d| d.is_ended())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.with_data(|d| d.duration())
    }

    pub fn start_time(&self) -> u64 {
        self.with_data(|d| d.start_time)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.with_data(|d| d.set_attribute(key, value));
    }

    pub fn set_attributes<I, K, V>(&self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.with_data(|d| d.set_attributes(attributes));
    }

    pub(crate) fn merge_attributes<I, K, V>(&self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.with_data(|d| d.merge_attributes(attributes));
    }

    pub fn add_event(&self, name: impl Into<String>) {
        self.with_data(|d| d.add_event(name));
    }

    pub fn add_event_with<I, K, V>(&self, name: impl Into<String>, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.with_data(|d| d.add_event_with(name, attributes));
    }

    pub fn add_link<I, K, V>(&self, target: &TraceContext, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.with_data(|d| d.add_link(target, attributes));
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.with_data(|d| d.set_status(status));
    }

    pub fn record_exception(&self, exception_type: &str, message: &str, stacktrace: Option<&str>) {
        self.with_data(|d| d.record_exception(exception_type, message, stacktrace));
    }

    pub fn record_error<E>(&self, err: &E)
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        self.with_data(|d| d.record_error(err));
    }

    pub fn end(&self) {
        self.with_data(|d| d.end());
    }

    pub fn record_phi_access(&self, data_type: &str, access_reason: &str, user_id: Option<&str>) {
        self.with_data(|d| d.record_phi_access(data_type, access_reason, user_id));
    }

    pub fn record_clinical_decision(&self, decision_type: &str, outcome: &str, confidence: Option<f64>) {
        self.with_data(|d| d.record_clinical_decision(decision_type, outcome, confidence));
    }

    pub fn record_compliance_checkpoint(&self, checkpoint: &str, passed: bool, details: Option<&str>) {
        self.with_data(|d| d.record_compliance_checkpoint(checkpoint, passed, details));
    }

    pub fn to_jaeger_format(&self, service_name: &str) -> JaegerSpan {
        self.with_data(|d| d.to_jaeger_format(service_name))
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.context.trace_id)
            .field("span_id", &self.context.span_id)
            .field("recording", &self.recording)
            .finish()
    }
}
