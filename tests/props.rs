//! Property tests for the wire and crypto layers.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

use corelink::crypto::SessionKey;
use corelink::protocol::{ChunkingFramer, CoapMessage, CoapType, MessageName, Token};
use corelink::types::MessageCounter;

proptest! {
    /// Any non-empty frame survives the framer unchanged.
    #[test]
    fn prop_framer_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..=1024)) {
        let mut framer = ChunkingFramer::new();
        let mut buf = BytesMut::new();

        framer.encode(Bytes::from(payload.clone()), &mut buf).unwrap();
        let decoded = framer.decode(&mut buf).unwrap().unwrap();

        prop_assert_eq!(&decoded[..], &payload[..]);
        prop_assert!(framer.decode(&mut buf).unwrap().is_none());
    }

    /// Split delivery cannot change what the framer yields.
    #[test]
    fn prop_framer_reassembles_across_splits(
        payload in proptest::collection::vec(any::<u8>(), 1..=512),
        split in 0usize..=514,
    ) {
        let mut framer = ChunkingFramer::new();
        let mut wire = BytesMut::new();
        framer.encode(Bytes::from(payload.clone()), &mut wire).unwrap();
        let wire = wire.freeze();

        let split = split.min(wire.len());
        let mut buf = BytesMut::from(&wire[..split]);
        let first = framer.decode(&mut buf).unwrap();
        if split < wire.len() {
            prop_assert!(first.is_none());
            buf.extend_from_slice(&wire[split..]);
        }
        let decoded = match first {
            Some(frame) => frame,
            None => framer.decode(&mut buf).unwrap().unwrap(),
        };
        prop_assert_eq!(&decoded[..], &payload[..]);
    }

    /// Decrypt(Encrypt(m)) == m for message sequences pushed through the
    /// framer, in both directions.
    #[test]
    fn prop_encrypted_frames_roundtrip(
        messages in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..600),
            1..8,
        )
    ) {
        let session_key = SessionKey::generate();

        for _direction in 0..2 {
            let (mut cipher, mut decipher) = session_key.streams();
            let mut sender = ChunkingFramer::new();
            let mut receiver = ChunkingFramer::new();
            let mut wire = BytesMut::new();

            for message in &messages {
                let ciphertext = cipher.encrypt_next(message);
                sender.encode(Bytes::from(ciphertext), &mut wire).unwrap();
            }

            for message in &messages {
                let frame = receiver.decode(&mut wire).unwrap().unwrap();
                let plain = decipher.decrypt_next(&frame).unwrap();
                prop_assert_eq!(&plain, message);
            }
            prop_assert!(receiver.decode(&mut wire).unwrap().is_none());
        }
    }

    /// After n messages the stream counter has advanced by exactly n,
    /// wrapping mod 2^32.
    #[test]
    fn prop_counter_advances_by_one_per_message(
        seed in any::<u32>(),
        n in 0usize..40,
    ) {
        let mut counter = MessageCounter::new(seed);
        for _ in 0..n {
            counter = counter.next();
        }
        prop_assert_eq!(counter.0, seed.wrapping_add(n as u32));

        let session_key = SessionKey::generate();
        let (mut cipher, _) = session_key.streams();
        let initial = cipher.counter();
        for _ in 0..n {
            cipher.encrypt_next(b"x");
        }
        prop_assert_eq!(cipher.counter().0, initial.0.wrapping_add(n as u32));
    }

    /// CoAP messages survive encode/decode.
    #[test]
    fn prop_coap_roundtrip(
        kind in 0u8..4,
        message_id in any::<u16>(),
        token in proptest::collection::vec(any::<u8>(), 0..=8),
        segments in proptest::collection::vec("[a-z]{1,4}", 0..3),
        queries in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..24),
            0..3,
        ),
        payload in proptest::collection::vec(any::<u8>(), 0..100),
    ) {
        let kind = match kind {
            0 => CoapType::Con,
            1 => CoapType::Non,
            2 => CoapType::Ack,
            _ => CoapType::Rst,
        };

        let mut msg = CoapMessage::request(kind, corelink::protocol::CoapCode::POST, message_id)
            .with_token(Token::from_slice(&token).unwrap());
        for segment in segments {
            msg = msg.with_uri_path(segment);
        }
        for query in queries {
            msg = msg.with_uri_query(query);
        }
        msg = msg.with_payload(payload);

        let decoded = CoapMessage::decode(&msg.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}

#[test]
fn test_symbolic_names_roundtrip_the_codec() {
    // Every request name survives the wire and resolves back to itself.
    let names = [
        MessageName::Hello,
        MessageName::Describe,
        MessageName::UpdateBegin,
        MessageName::UpdateDone,
        MessageName::Chunk,
        MessageName::ChunkMissed,
        MessageName::FunctionCall,
        MessageName::VariableRequest,
        MessageName::SignalStart,
        MessageName::Subscribe,
        MessageName::KeyChange,
        MessageName::GetTime,
        MessageName::PublicEvent,
        MessageName::PrivateEvent,
    ];

    for name in names {
        let msg = name.build(77);
        let decoded = CoapMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(MessageName::from_request(&decoded), Some(name), "{name}");
    }
}
