#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use quay_nsq::codec::FrameDecoder;
use quay_nsq::command::Command;

fuzz_target!(|data: &[u8]| {
    // Broker frames, fed in two uneven pieces to exercise partial reads
    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));
    let mut decoder = FrameDecoder::new(64 * 1024);
    decoder.extend(&data[..split]);
    while let Ok(Some(_)) = decoder.decode() {}
    decoder.extend(&data[split..]);
    while let Ok(Some(_)) = decoder.decode() {}

    // Client commands, as the broker side would parse them
    let mut buf = BytesMut::from(data);
    while let Ok(Some(cmd)) = Command::parse(&mut buf) {
        let mut out = BytesMut::new();
        cmd.encode(&mut out);
    }
});
