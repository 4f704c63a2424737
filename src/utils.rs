// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Small helpers shared by the retry policy, hedge policy, and
//! subconnection reconnect loop (§4.5, §4.8): all three grow a delay
//! geometrically up to a cap and want it jittered so a fleet of clients
//! doesn't retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// `initial * multiplier^attempt`, capped at `max`. `attempt` is 0-based
/// (the first backoff uses `initial` unscaled).
pub fn geometric_backoff(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    if max.is_zero() || initial.is_zero() {
        return Duration::ZERO;
    }
    let scaled = initial.as_secs_f64() * multiplier.max(1.0).powi(attempt as i32);
    Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
}

/// Full jitter: a uniformly random duration in `[0, delay]`. Spreads out
/// retries/reconnects that would otherwise all wake up at once.
pub fn full_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::rng().random_range(0.0..=delay.as_secs_f64());
    Duration::from_secs_f64(secs)
}
