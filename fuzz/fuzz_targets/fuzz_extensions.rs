#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(extensions) = numihash::wire::parse_extensions(data) {
        for (_kind, payload) in extensions.iter() {
            let _ = payload.len();
        }
    }
});
