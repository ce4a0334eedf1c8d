//! Fuzz target for script parsing and the semantic passes
//!
//! Arbitrary text is parsed and, when it parses, resolved. Both steps must
//! return structured errors rather than panic, and resolution must be
//! deterministic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wirescript_core::{parse, resolve};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(script) = parse(text) else {
        return;
    };

    let first = resolve(script.clone());
    let second = resolve(script);
    assert_eq!(first, second, "resolve must be deterministic");

    if let Ok(resolved) = first {
        // Rendering the resolved script must not panic either.
        let _ = resolved.to_string();
    }
});
