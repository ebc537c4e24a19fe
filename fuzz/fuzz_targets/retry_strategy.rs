#![no_main]

use std::time::Duration;

use fabula_retry::Backoff;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u64, u64, u32)| {
    let (max_attempts, base_ms, max_ms, attempt) = data;
    let backoff = Backoff {
        max_attempts,
        base_delay: Duration::from_millis(base_ms % 1_000_000),
        max_delay: Duration::from_millis(max_ms % 1_000_000),
        jitter: 0.0,
    };
    // Without jitter no delay may exceed the cap, for any attempt number.
    let delay = backoff.delay_for(attempt);
    assert!(delay <= backoff.max_delay);
});
