#![no_main]

use libfuzzer_sys::fuzz_target;
use vnet_protocol::core::packet::Packet;
use vnet_protocol::protocol::message::Message;
use vnet_protocol::transport::Datagram;

fuzz_target!(|data: &[u8]| {
    let _ = Datagram::classify(data);

    if let Ok(mut packet) = Packet::from_bytes(data) {
        // MAC check on hostile headers, then the plaintext path
        let _ = packet.clone().dearmor(&[0u8; 32]);
        if packet.uncompress().is_ok() {
            let _ = Message::decode(packet.verb_raw(), packet.payload());
        }
    }

    // Every verb parser sees the same bytes as a payload
    for verb in 0u8..32 {
        let _ = Message::decode(verb, data);
    }
});
