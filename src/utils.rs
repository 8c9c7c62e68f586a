// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rand::Rng;

/// Returns a random duration uniformly distributed in `[min, max]`. Used for
/// the WriterTask's opportunistic-drain ticker and
/// `WaitForHot`'s poll interval, so that many connections
/// reconnecting or polling at once don't all wake in lockstep.
pub fn jittered_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = max - min;
    let extra = rand::rng().random_range(0..=span.as_millis() as u64);
    min + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_duration_stays_in_bounds() {
        let min = Duration::from_millis(750);
        let max = Duration::from_millis(1250);
        for _ in 0..100 {
            let d = jittered_duration(min, max);
            assert!(d >= min && d <= max);
        }
    }

    #[test]
    fn degenerate_range_returns_min() {
        let d = Duration::from_millis(50);
        assert_eq!(jittered_duration(d, d), d);
    }
}
