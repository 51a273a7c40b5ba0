#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(decoded) = numihash::parse_request(data) {
        let _ = numihash::encode_request(&decoded.request, decoded.epoch, &decoded.extensions);
    }
});
