//! Property-based round-trip coverage for the message encoder/decoder (C2):
//! arbitrary request/response heads and chunk payloads must decode back to
//! exactly what was encoded, in both protocol versions.

use bridge_transport::wire::{
    decode_chunk, decode_request_head, decode_response_head, encode_chunk_payload,
    encode_request_full, encode_response_full, FrameType, ProtocolVersion,
};
use proptest::prelude::*;

fn token() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9/_.-]{0,16}"
}

fn header_pair() -> impl Strategy<Value = (String, String)> {
    (token(), token())
}

fn version() -> impl Strategy<Value = ProtocolVersion> {
    prop_oneof![Just(ProtocolVersion::V1), Just(ProtocolVersion::V2)]
}

proptest! {
    #[test]
    fn request_full_round_trips_for_any_version(
        version in version(),
        method in token(),
        path in token(),
        query in token(),
        headers in proptest::collection::vec(header_pair(), 0..6),
        body in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let owned_headers: Vec<(&str, &str)> = headers.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
        let payload = encode_request_full(
            version,
            &method,
            "http",
            "example.com",
            &path,
            &query,
            "1.1",
            owned_headers.iter().copied(),
            &body,
        ).unwrap();

        let (decoded_version, frame_type, head) = decode_request_head(&payload).unwrap();
        prop_assert_eq!(decoded_version, version);
        prop_assert_eq!(frame_type, FrameType::ReqFull);
        prop_assert_eq!(head.method, method.as_str());
        prop_assert_eq!(head.path, path.as_str());
        prop_assert_eq!(head.query, query.as_str());
        prop_assert_eq!(head.inline_body, Some(body.as_slice()));
        prop_assert_eq!(head.headers.len(), headers.len());
        for (name, value) in &headers {
            prop_assert_eq!(head.headers.find(name), Some(value.as_str()));
        }
    }

    #[test]
    fn response_full_round_trips_for_any_version(
        version in version(),
        status in 100u16..600,
        headers in proptest::collection::vec(header_pair(), 0..6),
        body in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let owned_headers: Vec<(&str, &str)> = headers.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
        let payload = encode_response_full(version, status, owned_headers.iter().copied(), &body).unwrap();

        let (decoded_version, frame_type, head) = decode_response_head(&payload).unwrap();
        prop_assert_eq!(decoded_version, version);
        prop_assert_eq!(frame_type, FrameType::RespFull);
        prop_assert_eq!(head.status, status);
        prop_assert_eq!(head.inline_body, Some(body.as_slice()));
        for (name, value) in &headers {
            prop_assert_eq!(head.headers.find(name), Some(value.as_str()));
        }
    }

    #[test]
    fn chunk_payload_round_trips_for_any_version(
        version in version(),
        chunk in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let payload = encode_chunk_payload(version, FrameType::ReqChunk, &chunk).unwrap();
        let decoded = decode_chunk(&payload, FrameType::ReqChunk).unwrap();
        prop_assert_eq!(decoded, chunk.as_slice());
    }
}
