#![no_main]

use libfuzzer_sys::fuzz_target;
use vnet_protocol::config::MAX_PACKET_LENGTH;
use vnet_protocol::core::address::Address;
use vnet_protocol::core::packet::Packet;
use vnet_protocol::protocol::Verb;
use vnet_protocol::utils::compression::{compress_block, decompress_block};

fuzz_target!(|data: &[u8]| {
    // Block round trip must restore the input exactly
    if data.len() <= MAX_PACKET_LENGTH {
        if let Ok(compressed) = compress_block(data) {
            let restored = decompress_block(&compressed, MAX_PACKET_LENGTH);
            assert_eq!(restored.ok().as_deref(), Some(data));
        }
    }

    // Raw decompression of hostile input must respect the size limit
    if let Ok(out) = decompress_block(data, MAX_PACKET_LENGTH) {
        assert!(out.len() <= MAX_PACKET_LENGTH);
    }

    // Packet-level compression never grows the packet
    if data.len() + 28 <= MAX_PACKET_LENGTH {
        let mut p = Packet::new(Address::new(1), Address::new(2), Verb::Frame);
        p.append(data);
        let before = p.len();
        p.compress();
        assert!(p.len() <= before);
        let _ = p.uncompress();
        assert_eq!(p.payload(), data);
    }
});
