// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Run operations inside spans.
//!
//! The span is always finished: on success (status ok), on error (exception
//! recorded, error returned unchanged), on panic and when the future is
//! dropped before completion.

use std::fmt::{Debug, Display};
use std::future::Future;

use super::context;
use super::span::{HealthcareContext, Span, SpanKind, SpanStatus};
use super::system::TelemetrySystem;

/// Finishes its span when dropped unless disarmed first.
struct SpanGuard<'a> {
    system: &'a TelemetrySystem,
    span: Span,
    armed: bool,
}

impl<'a> SpanGuard<'a> {
    fn new(system: &'a TelemetrySystem, span: Span) -> Self {
        Self {
            system,
            span,
            armed: true,
        }
    }

    fn complete<T, E>(mut self, result: &Result<T, E>)
    where
        E: Display + Debug,
    {
        match result {
            Ok(_) => self.span.set_status(SpanStatus::ok()),
            Err(e) => self.span.record_error(e),
        }
        self.armed = false;
        self.system.finish_span(&self.span);
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = if std::thread::panicking() {
            "panicked"
        } else {
            "cancelled"
        };
        self.span.set_status(SpanStatus::error(reason));
        self.system.finish_span(&self.span);
    }
}

impl TelemetrySystem {
    /// Run `operation` in a new span that is current for its duration.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let order = telemetry
    ///     .with_telemetry("checkout", SpanKind::Server, |span| async move {
    ///         span.set_attribute("cart.items", 3);
    ///         place_order().await
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_telemetry<F, Fut, T, E>(
        &self,
        name: &str,
        kind: SpanKind,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Span) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        self.run_in_span(name, kind, None, operation).await
    }

    /// [`TelemetrySystem::with_telemetry`] with healthcare annotations.
    pub async fn with_healthcare_telemetry<F, Fut, T, E>(
        &self,
        name: &str,
        healthcare_context: HealthcareContext,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Span) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        self.run_in_span(name, SpanKind::Internal, Some(healthcare_context), operation)
            .await
    }

    async fn run_in_span<F, Fut, T, E>(
        &self,
        name: &str,
        kind: SpanKind,
        healthcare_context: Option<HealthcareContext>,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Span) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        let span = self.start_span(name, kind, healthcare_context, None);
        let guard = SpanGuard::new(self, span.clone());

        let result = context::with_context(span.context().clone(), operation(span)).await;

        guard.complete(&result);
        result
    }

    /// Synchronous [`TelemetrySystem::with_telemetry`].
    pub fn in_span<F, T, E>(&self, name: &str, kind: SpanKind, operation: F) -> Result<T, E>
    where
        F: FnOnce(&Span) -> Result<T, E>,
        E: Display + Debug,
    {
        let span = self.start_span(name, kind, None, None);
        let guard = SpanGuard::new(self, span.clone());

        let result = context::with_context_sync(span.context().clone(), || operation(&span));

        guard.complete(&result);
        result
    }

    /// Wrap a function so every call runs in its own span.
    pub fn wrap_with_span<A, T, E, F>(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        f: F,
    ) -> impl Fn(A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        E: Display + Debug,
    {
        let system = self.clone();
        let name = name.into();
        move |arg| system.in_span(&name, kind, |_| f(arg))
    }
}
