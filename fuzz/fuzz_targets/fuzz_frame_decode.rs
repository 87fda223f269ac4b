#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use snapper_producer::codec::FrameDecoder;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the input in two pieces so partial-frame buffering is exercised.
    let split = data.first().map_or(0, |&b| usize::from(b)).min(data.len());
    let (head, tail) = data.split_at(split);

    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    for chunk in [head, tail] {
        buf.extend_from_slice(chunk);
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
});
