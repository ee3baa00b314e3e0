// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide telemetry instance.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::TelemetryConfiguration;

use super::system::TelemetrySystem;

static GLOBAL: Lazy<RwLock<Option<TelemetrySystem>>> = Lazy::new(|| RwLock::new(None));

/// Install a new global system and start its export loop.
///
/// A previously installed system stops exporting periodically; spans still
/// held through it can be flushed with its own `shutdown`.
pub fn initialize_telemetry(config: TelemetryConfiguration) -> TelemetrySystem {
    let system = TelemetrySystem::new(config);
    system.start_export_loop();

    let previous = GLOBAL
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .replace(system.clone());
    if let Some(previous) = previous {
        debug!("Replacing global telemetry system");
        previous.detach();
    }

    system
}

/// The global system, created with default configuration on first use.
///
/// The export loop starts on the first call made inside a tokio runtime,
/// so a system first reached from synchronous code still exports later.
pub fn get_telemetry() -> TelemetrySystem {
    let existing = GLOBAL
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .cloned();
    let system = match existing {
        Some(system) => system,
        None => GLOBAL
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| TelemetrySystem::new(TelemetryConfiguration::default()))
            .clone(),
    };

    ensure_export_loop(&system);
    system
}

fn ensure_export_loop(system: &TelemetrySystem) {
    if system.is_export_loop_running() || system.is_shut_down() {
        return;
    }
    if tokio::runtime::Handle::try_current().is_ok() && system.start_export_loop() {
        debug!("Started export loop for global telemetry system");
    }
}

/// Shut down and remove the global system, if any.
pub async fn shutdown_telemetry() {
    let system = GLOBAL.write().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(system) = system {
        system.shutdown().await;
    }
}
