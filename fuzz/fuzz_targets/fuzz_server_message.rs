#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Classification must never panic, whatever the payload.
    if let Ok(message) = snapper_producer::protocol::parse_message(data) {
        let _ = message.command_id();
    }
});
