//! Unit tests for the RFC 6455 parser and generator.

use bytes::BytesMut;
use rstest::{fixture, rstest};

use super::*;
use crate::codec::MAX_HEADER_LENGTH;

#[fixture]
fn client_parser() -> Rfc6455Parser {
    // Client endpoints receive unmasked frames.
    Rfc6455Parser::new(&Policy::client())
}

#[fixture]
fn server_parser() -> Rfc6455Parser {
    Rfc6455Parser::new(&Policy::server())
}

fn parse_all(parser: &mut Rfc6455Parser, bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
    let mut input = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = parser.parse(&mut input)? {
        frames.push(frame);
    }
    Ok(frames)
}

#[rstest]
fn parses_unmasked_text_frame(mut client_parser: Rfc6455Parser) {
    let frames = parse_all(&mut client_parser, b"\x81\x05hello").expect("parse");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode(), OpCode::Text);
    assert!(frames[0].fin());
    assert_eq!(frames[0].payload().as_ref(), b"hello");
}

#[rstest]
fn unmasks_client_frame(mut server_parser: Rfc6455Parser) {
    // "hi" masked with key 0x01020304
    let wire = [0x82, 0x82, 0x01, 0x02, 0x03, 0x04, b'h' ^ 0x01, b'i' ^ 0x02];
    let frames = parse_all(&mut server_parser, &wire).expect("parse");
    assert_eq!(frames[0].opcode(), OpCode::Binary);
    assert_eq!(frames[0].payload().as_ref(), b"hi");
}

#[rstest]
fn restartable_across_arbitrary_splits(#[values(1, 2, 3, 5)] chunk: usize) {
    let wire = b"\x81\x05hello\x89\x02hi";
    let mut parser = Rfc6455Parser::new(&Policy::client());
    let mut frames = Vec::new();
    for piece in wire.chunks(chunk) {
        let mut input = BytesMut::from(piece);
        while let Some(frame) = parser.parse(&mut input).expect("parse") {
            frames.push(frame);
        }
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].payload().as_ref(), b"hello");
    assert_eq!(frames[1].opcode(), OpCode::Ping);
    assert_eq!(frames[1].payload().as_ref(), b"hi");
}

#[rstest]
fn rejects_unmasked_frame_on_server(mut server_parser: Rfc6455Parser) {
    let err = parse_all(&mut server_parser, b"\x81\x02hi").unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[rstest]
fn rejects_masked_frame_on_client(mut client_parser: Rfc6455Parser) {
    let err = parse_all(&mut client_parser, &[0x81, 0x80, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[rstest]
fn rejects_reserved_bit_without_extension(mut client_parser: Rfc6455Parser) {
    let err = parse_all(&mut client_parser, b"\xC1\x02hi").unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[rstest]
fn accepts_reserved_bit_when_negotiated(mut client_parser: Rfc6455Parser) {
    client_parser.set_rsv_allowed(true, false, false);
    let frames = parse_all(&mut client_parser, b"\xC1\x02hi").expect("parse");
    assert!(frames[0].rsv1());
}

#[rstest]
#[case::reserved_opcode(b"\x83\x00".as_slice())]
#[case::fragmented_control(b"\x08\x00".as_slice())]
#[case::oversized_control(&{
    let mut wire = vec![0x89, 126, 0x00, 126];
    wire.extend_from_slice(&[0u8; 126]);
    wire
})]
#[case::continuation_without_message(b"\x80\x02hi".as_slice())]
fn protocol_violations(#[case] wire: impl AsRef<[u8]>, mut client_parser: Rfc6455Parser) {
    let err = parse_all(&mut client_parser, wire.as_ref()).unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)), "got {err:?}");
}

#[rstest]
fn rejects_new_data_frame_mid_message(mut client_parser: Rfc6455Parser) {
    // TEXT with FIN clear starts a fragmented message.
    parse_all(&mut client_parser, b"\x01\x02hi").expect("first fragment");
    let err = parse_all(&mut client_parser, b"\x81\x02hi").unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[rstest]
fn control_frame_allowed_between_fragments(mut client_parser: Rfc6455Parser) {
    parse_all(&mut client_parser, b"\x01\x02hi").expect("first fragment");
    let frames = parse_all(&mut client_parser, b"\x89\x00\x80\x02hi").expect("ping + tail");
    assert_eq!(frames[0].opcode(), OpCode::Ping);
    assert_eq!(frames[1].opcode(), OpCode::Continuation);
    assert!(frames[1].fin());
}

#[test]
fn enforces_max_frame_size() {
    let policy = Policy::client().with_max_frame_size(8).expect("size");
    let mut parser = Rfc6455Parser::new(&policy);
    let mut wire = vec![0x82, 9];
    wire.extend_from_slice(&[0u8; 9]);
    let err = parse_all(&mut parser, &wire).unwrap_err();
    assert!(matches!(
        err,
        CodecError::MessageTooLarge { size: 9, max: 8 }
    ));
}

#[test]
fn enforces_max_message_size_across_fragments() {
    let policy = Policy::client().with_max_message_size(6).expect("size");
    let mut parser = Rfc6455Parser::new(&policy);
    parse_all(&mut parser, b"\x01\x04abcd").expect("first fragment");
    let err = parse_all(&mut parser, b"\x80\x04efgh").unwrap_err();
    assert!(matches!(
        err,
        CodecError::MessageTooLarge { size: 8, max: 6 }
    ));
}

#[rstest]
#[case::bare_code(b"\x88\x02\x03\xE8".as_slice(), true)]
#[case::code_and_reason(b"\x88\x05\x03\xE8bye".as_slice(), true)]
#[case::empty(b"\x88\x00".as_slice(), true)]
#[case::one_byte(b"\x88\x01\x03".as_slice(), false)]
#[case::reserved_code(b"\x88\x02\x03\xED".as_slice(), false)]
fn close_payload_validation(
    #[case] wire: &[u8],
    #[case] accepted: bool,
    mut client_parser: Rfc6455Parser,
) {
    let result = parse_all(&mut client_parser, wire);
    assert_eq!(result.is_ok(), accepted, "got {result:?}");
}

#[rstest]
fn close_reason_must_be_utf8(mut client_parser: Rfc6455Parser) {
    let err = parse_all(&mut client_parser, &[0x88, 0x03, 0x03, 0xE8, 0xFF]).unwrap_err();
    assert!(matches!(err, CodecError::BadPayload(_)));
}

#[test]
fn server_generator_emits_unmasked_header() {
    let mut generator = Rfc6455Generator::new(&Policy::server());
    let mut out = BytesMut::new();
    let written = generator
        .generate(&Frame::text("hello"), &mut out)
        .expect("generate");
    assert_eq!(written, 7);
    assert_eq!(out.as_ref(), b"\x81\x05hello");
}

#[test]
fn generator_uses_extended_length_at_126() {
    let mut generator = Rfc6455Generator::new(&Policy::server());
    let mut out = BytesMut::new();
    generator
        .generate(&Frame::binary(vec![0u8; 126]), &mut out)
        .expect("generate");
    assert_eq!(&out[..4], &[0x82, 126, 0x00, 126]);
    assert_eq!(out.len(), 4 + 126);
}

#[test]
fn client_generator_masks_payload() {
    let mut generator = Rfc6455Generator::new(&Policy::client());
    let mut out = BytesMut::new();
    let written = generator
        .generate(&Frame::text("hello"), &mut out)
        .expect("generate");
    assert_eq!(written, 2 + 4 + 5);
    assert_eq!(out[1] & 0x80, 0x80, "mask bit must be set");

    // A server parser recovers the original payload.
    let mut parser = Rfc6455Parser::new(&Policy::server());
    let frame = parser.parse(&mut out).expect("parse").expect("frame");
    assert_eq!(frame.payload().as_ref(), b"hello");
}

#[rstest]
#[case::small(5, 2)]
#[case::extended16(200, 4)]
#[case::extended64(70_000, 10)]
fn header_length_matches_encoding(#[case] payload_len: usize, #[case] expected: usize) {
    let generator = Rfc6455Generator::new(&Policy::server());
    let frame = Frame::binary(vec![0u8; payload_len]);
    assert_eq!(generator.header_length(&frame), expected);

    let client = Rfc6455Generator::new(&Policy::client());
    assert_eq!(client.header_length(&frame), expected + 4);
}

#[test]
fn generator_rejects_oversized_control_frame() {
    let mut generator = Rfc6455Generator::new(&Policy::server());
    let mut out = BytesMut::new();
    let err = generator
        .generate(&Frame::ping(vec![0u8; 126]), &mut out)
        .unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[test]
fn max_header_bound_covers_generated_headers() {
    let generator = Rfc6455Generator::new(&Policy::client());
    let frame = Frame::binary(vec![0u8; 70_000]);
    assert!(generator.header_length(&frame) <= MAX_HEADER_LENGTH);
}
