// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Monotonic, epoch-anchored timestamps.
//!
//! The wall clock is read once per process and every later timestamp is that
//! anchor plus an `Instant` offset, so span times never go backwards even if
//! the system clock is adjusted.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static ANCHOR: Lazy<(Instant, u64)> = Lazy::new(|| {
    let epoch_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    (Instant::now(), epoch_micros)
});

/// Microseconds since the Unix epoch, read from the monotonic clock.
pub fn now_micros() -> u64 {
    let (instant, epoch_micros) = *ANCHOR;
    epoch_micros + instant.elapsed().as_micros() as u64
}
