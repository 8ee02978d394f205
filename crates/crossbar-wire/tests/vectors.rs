// Byte-level vectors pinning the on-wire layout.
use bytes::Bytes;
use crossbar_wire::{control, Flags, Message, RecvBuffer, HEADER_LEN};

#[test]
fn header_layout_is_little_endian_and_packed() {
    let msg = Message::new(
        0x0102_0304,
        0x0007,
        Flags::REPLY,
        Bytes::from_static(b"\xAA\xBB"),
    )
    .expect("msg");
    let encoded = msg.encode();
    assert_eq!(encoded.len(), HEADER_LEN + 2);
    // sender, little-endian
    assert_eq!(&encoded[0..4], &[0x04, 0x03, 0x02, 0x01]);
    // kind field: low 16 bits kind, high 16 bits token 0x4342
    assert_eq!(&encoded[4..8], &[0x07, 0x00, 0x42, 0x43]);
    // flags: REPLY
    assert_eq!(&encoded[8..10], &[0x01, 0x00]);
    // payload length
    assert_eq!(&encoded[10..12], &[0x02, 0x00]);
    assert_eq!(&encoded[12..], &[0xAA, 0xBB]);
}

#[test]
fn notify_body_layout() {
    let notify = control::Notify {
        target: 5,
        topic: 1 << 2,
        kind: 42,
        payload: Bytes::from_static(b"hi"),
    };
    let encoded = notify.encode();
    assert_eq!(&encoded[0..4], &[0x05, 0x00, 0x00, 0x00]);
    assert_eq!(&encoded[4..12], &[0x04, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(&encoded[12..16], &[42, 0, 0, 0]);
    assert_eq!(&encoded[16..], b"hi");
}

#[test]
fn back_to_back_messages_reassemble_in_order() {
    let msgs: Vec<Message> = (0..8)
        .map(|i| {
            Message::new(
                i,
                (i as u16) + 1,
                Flags::default(),
                Bytes::from(vec![i as u8; i as usize]),
            )
            .expect("msg")
        })
        .collect();
    let mut stream = Vec::new();
    for msg in &msgs {
        stream.extend_from_slice(&msg.encode());
    }

    // Arbitrary chunk sizes, including ones that straddle headers.
    for chunk in [1usize, 3, 7, 64] {
        let mut buf = RecvBuffer::with_capacity(256);
        let mut seen = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.push(piece);
            while let Some(msg) = buf.reassemble().expect("reassemble") {
                seen.push(msg);
            }
        }
        assert_eq!(seen, msgs, "chunk size {chunk}");
    }
}
