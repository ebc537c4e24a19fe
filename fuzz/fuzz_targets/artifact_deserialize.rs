#![no_main]

use fabula::artifacts::{ChapterContent, ChapterPlan, Issue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ChapterPlan>(data);
    let _ = serde_json::from_slice::<ChapterContent>(data);
    let _ = serde_json::from_slice::<Issue>(data);
});
