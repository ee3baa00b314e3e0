// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trace identity and context propagation.
//!
//! A [`TraceContext`] links spans into a tree: children share the parent's
//! trace id, point at the parent's span id, and inherit a copy of its baggage.
//! The ambient "current" context is task-local so concurrent requests on one
//! runtime never see each other's parents.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Option<TraceContext>>;
}

/// 128-bit identifier shared by every span in one trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self)
    }
}

impl FromStr for TraceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Self)
    }
}

/// 64-bit identifier unique to one span.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// Generate a new random, non-zero span ID.
    pub fn new() -> Self {
        loop {
            let (high, _) = Uuid::new_v4().as_u64_pair();
            if high != 0 {
                return Self(high);
            }
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self)
    }
}

impl FromStr for SpanId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(TraceId);
hex_serde!(SpanId);

/// Trace-level flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// Bit 0: the trace is sampled.
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_sampled(&self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }
}

/// Propagatable identity of one span within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub trace_flags: TraceFlags,
    #[serde(default)]
    pub baggage: HashMap<String, String>,
}

impl TraceContext {
    /// Mint a context for a new trace.
    ///
    /// Contexts are always created sampled; whether a span is recorded is
    /// decided later, when it is started.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
            parent_span_id: None,
            trace_flags: TraceFlags::SAMPLED,
            baggage: HashMap::new(),
        }
    }

    /// Derive a child: same trace, new span id, this span as parent, copied baggage.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::new(),
            parent_span_id: Some(self.span_id),
            trace_flags: TraceFlags::SAMPLED,
            baggage: self.baggage.clone(),
        }
    }

    /// Derive from an optional parent, minting a root when there is none.
    pub fn derive(parent: Option<&TraceContext>) -> Self {
        match parent {
            Some(parent) => parent.child(),
            None => Self::new_root(),
        }
    }

    /// Add a baggage entry (builder style).
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_baggage(key, value);
        self
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key.into(), value.into());
    }

    pub fn baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Render as a W3C `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            self.trace_flags.bits()
        )
    }

    /// Parse a W3C `traceparent` header into a remote parent context.
    ///
    /// Returns `None` for malformed headers or all-zero ids.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id: TraceId = trace_id.parse().ok()?;
        let span_id: SpanId = span_id.parse().ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;

        if trace_id.as_u128() == 0 || span_id.as_u64() == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            trace_flags: TraceFlags::new(flags),
            baggage: HashMap::new(),
        })
    }
}

/// The context scoped to the current task, if any.
pub fn scoped_context() -> Option<TraceContext> {
    task_context().flatten()
}

/// `None` outside a scope; otherwise the scope's current context.
pub(crate) fn task_context() -> Option<Option<TraceContext>> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.borrow().clone()).ok()
}

/// Replace the current context of the enclosing scope.
///
/// Returns `false` when called outside a scope.
pub(crate) fn set_task_context(ctx: Option<TraceContext>) -> bool {
    CURRENT_CONTEXT
        .try_with(|current| *current.borrow_mut() = ctx)
        .is_ok()
}

/// Run a future with `ctx` as the task-local current context.
pub async fn with_context<F>(ctx: TraceContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(RefCell::new(Some(ctx)), future).await
}

/// Run a closure with `ctx` as the current context.
pub fn with_context_sync<R>(ctx: TraceContext, f: impl FnOnce() -> R) -> R {
    CURRENT_CONTEXT.sync_scope(RefCell::new(Some(ctx)), f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TraceId::new(), TraceId::new());
        assert_ne!(SpanId::new(), SpanId::new());
    }

    #[test]
    fn test_id_hex_format() {
        let trace_id = TraceId::from_u128(0xabc);
        let span_id = SpanId::from_u64(0x1f);
        assert_eq!(trace_id.to_string(), "00000000000000000000000000000abc");
        assert_eq!(span_id.to_string(), "000000000000001f");
        assert_eq!(TraceId::new().to_string().len(), 32);
        assert_eq!(SpanId::new().to_string().len(), 16);
    }

    #[test]
    fn test_id_serde_as_hex() {
        let span_id = SpanId::from_u64(255);
        let json = serde_json::to_string(&span_id).unwrap();
        assert_eq!(json, "\"00000000000000ff\"");
        let parsed: SpanId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, span_id);
    }

    #[test]
    fn test_root_context() {
        let ctx = TraceContext::new_root();
        assert!(ctx.is_root());
        assert!(ctx.trace_flags.is_sampled());
        assert!(ctx.baggage.is_empty());
    }

    #[test]
    fn test_child_shares_trace_and_links_parent() {
        let parent = TraceContext::new_root();
        let child = parent.child();
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id, Some(parent.span_id));
        assert_ne!(child.span_id, parent.span_id);
        assert!(child.trace_flags.is_sampled());
    }

    #[test]
    fn test_baggage_is_copied_not_shared() {
        let parent = TraceContext::new_root().with_baggage("tenant", "clinic-7");
        let mut child = parent.child();
        child.set_baggage("request", "r-1");

        assert_eq!(child.baggage_item("tenant"), Some("clinic-7"));
        assert_eq!(child.baggage_item("request"), Some("r-1"));
        assert_eq!(parent.baggage_item("request"), None);
        assert_eq!(parent.baggage.len(), 1);
    }

    #[test]
    fn test_derive_without_parent_is_root() {
        assert!(TraceContext::derive(None).is_root());
        let parent = TraceContext::new_root();
        assert_eq!(TraceContext::derive(Some(&parent)).trace_id, parent.trace_id);
    }

    #[test]
    fn test_traceparent_roundtrip() {
        let ctx = TraceContext::new_root();
        let header = ctx.to_traceparent();
        assert!(header.starts_with("00-"));
        assert!(header.ends_with("-01"));

        let parsed = TraceContext::from_traceparent(&header).unwrap();
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
    }

    #[test]
    fn test_traceparent_rejects_malformed() {
        assert!(TraceContext::from_traceparent("garbage").is_none());
        assert!(TraceContext::from_traceparent(
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        )
        .is_none());
        assert!(TraceContext::from_traceparent(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
        assert!(TraceContext::from_traceparent("00-abc-b7ad6b7169203331-01").is_none());
    }

    #[test]
    fn test_scoped_context_outside_scope() {
        assert!(scoped_context().is_none());
    }

    #[test]
    fn test_sync_scope_sets_context() {
        let ctx = TraceContext::new_root();
        let seen = with_context_sync(ctx.clone(), scoped_context);
        assert_eq!(seen.unwrap().span_id, ctx.span_id);
        assert!(scoped_context().is_none());
    }

    #[test]
    fn test_set_task_context_inside_scope() {
        assert!(!set_task_context(Some(TraceContext::new_root())));

        let outer = TraceContext::new_root();
        let replacement = outer.child();
        let (seen, cleared) = with_context_sync(outer, || {
            assert!(set_task_context(Some(replacement.clone())));
            let seen = scoped_context();
            set_task_context(None);
            (seen, task_context())
        });

        assert_eq!(seen.unwrap().span_id, replacement.span_id);
        assert_eq!(cleared, Some(None));
        assert!(task_context().is_none());
    }

    #[tokio::test]
    async fn test_async_scopes_are_isolated() {
        let a = TraceContext::new_root();
        let b = TraceContext::new_root();

        let (seen_a, seen_b) = tokio::join!(
            with_context(a.clone(), async {
                tokio::task::yield_now().await;
                scoped_context()
            }),
            with_context(b.clone(), async {
                tokio::task::yield_now().await;
                scoped_context()
            }),
        );

        assert_eq!(seen_a.unwrap().trace_id, a.trace_id);
        assert_eq!(seen_b.unwrap().trace_id, b.trace_id);
    }
}
