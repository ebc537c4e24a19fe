#![no_main]

use fabula::retrieval::sanitize_query;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(query) = std::str::from_utf8(data) {
        let once = sanitize_query(query);
        // Sanitization must be idempotent and never panic.
        assert_eq!(sanitize_query(&once), once);
    }
});
