// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A monotonic quarter-second clock, used by the operation/status facility
//! to decide when a transient status has been running long enough to be
//! worth showing.

/// Number of clock ticks in [`Operation::start_transient`](crate::operation::Operation::start_transient)'s
/// grace period before a transient status is allowed to reach the status
/// callback.
pub const TRANSIENT_DELAY_TICKS: u32 = 5;

/// Returns the current time as a count of quarter-seconds since the Unix
/// epoch.
///
/// Four ticks per second matches the granularity the status facility cares
/// about: frequent enough that `progress()` calls during a fast operation
/// still get coalesced, coarse enough that it's cheap to compute on every
/// call.
pub fn stamp() -> u32 {
    #[cfg(test)]
    {
        if let Some(value) = test_override::get() {
            return value;
        }
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    (now.as_secs() as u32).wrapping_mul(4) + now.subsec_millis() / 250
}

#[cfg(test)]
pub(crate) mod test_override {
    use std::sync::{Mutex, OnceLock};

    static OVERRIDE: OnceLock<Mutex<Option<u32>>> = OnceLock::new();

    pub(crate) fn get() -> Option<u32> {
        OVERRIDE.get().and_then(|cell| *cell.lock().expect("lock is poisoned"))
    }

    pub(crate) fn set(value: Option<u32>) {
        let cell = OVERRIDE.get_or_init(|| Mutex::new(None));
        *cell.lock().expect("lock is poisoned") = value;
    }
}
