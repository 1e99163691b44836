//! Property tests for the ring buffer delivery laws

use proptest::prelude::*;

use relay::RingBuffer;

proptest! {
    /// Every written record is delivered exactly once, in write order, with
    /// its payload intact, across arbitrary interleavings of writes and
    /// drains (including wrap-around padding).
    #[test]
    fn ring_delivers_exactly_once_in_order(
        payload_lens in proptest::collection::vec(1usize..100, 1..200)
    ) {
        let ring = RingBuffer::new(2048).unwrap();
        let mut expected = Vec::new();
        let mut delivered = Vec::new();

        for (i, len) in payload_lens.iter().enumerate() {
            let payload: Vec<u8> = (0..*len).map(|j| ((i + j) % 251) as u8).collect();
            while !ring.write(1, &payload).unwrap() {
                ring.read(|_, bytes| delivered.push(bytes.to_vec()), 16);
            }
            expected.push(payload);
        }
        while ring.size() > 0 {
            ring.read(|_, bytes| delivered.push(bytes.to_vec()), 16);
        }

        prop_assert_eq!(expected, delivered);
    }

    /// Message-type ids survive the frame round trip in order.
    #[test]
    fn ring_preserves_message_type_ids(
        type_ids in proptest::collection::vec(1i32..10_000, 1..64)
    ) {
        let ring = RingBuffer::new(4096).unwrap();
        let mut delivered = Vec::new();

        for type_id in &type_ids {
            while !ring.write(*type_id, &type_id.to_le_bytes()).unwrap() {
                ring.read(|id, _| delivered.push(id), 8);
            }
        }
        while ring.size() > 0 {
            ring.read(|id, _| delivered.push(id), 8);
        }

        prop_assert_eq!(type_ids, delivered);
    }
}
