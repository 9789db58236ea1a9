#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any pattern either fails to parse or yields a plan; never panics
    if let Ok(pattern) = std::str::from_utf8(data) {
        let _ = meshgrep::index::plan(pattern, false);
        let _ = meshgrep::index::plan(pattern, true);
    }
    let _ = meshgrep::utils::extract_trigrams(data);
    let _ = meshgrep::utils::fold_content(data);
});
