use bytes::Bytes;

use super::param_outgoing_reset_request::ParamOutgoingResetRequest;
use super::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use super::param_zero_checksum::ParamZeroChecksumAcceptable;
use super::*;

fn reset_request_bytes_with_streams() -> Bytes {
    Bytes::from_static(&[
        0x00, 0x0d, 0x00, 0x16, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00,
        0x00, 0x03, 0x00, 0x04, 0x00, 0x05, 0x00, 0x06,
    ])
}

fn reset_request_bytes_without_streams() -> Bytes {
    Bytes::from_static(&[
        0x0, 0xd, 0x0, 0x10, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x2, 0x0, 0x0, 0x0, 0x3,
    ])
}

#[test]
fn test_param_outgoing_reset_request_success() {
    let cases = [
        (
            reset_request_bytes_with_streams(),
            ParamOutgoingResetRequest {
                reconfig_request_sequence_number: 1,
                reconfig_response_sequence_number: 2,
                sender_last_tsn: 3,
                stream_identifiers: vec![4, 5, 6],
            },
        ),
        (
            reset_request_bytes_without_streams(),
            ParamOutgoingResetRequest {
                reconfig_request_sequence_number: 1,
                reconfig_response_sequence_number: 2,
                sender_last_tsn: 3,
                stream_identifiers: vec![],
            },
        ),
    ];

    for (i, (binary, expected)) in cases.iter().enumerate() {
        let actual = Param::unmarshal(binary).unwrap_or_else(|e| panic!("case {i}: {e}"));
        assert_eq!(
            actual,
            Param::OutgoingResetRequest(expected.clone()),
            "case {i}"
        );
        let marshaled = actual.marshal().unwrap();
        assert_eq!(&marshaled, binary, "case {i}");
    }
}

#[test]
fn test_param_outgoing_reset_request_failure() {
    let cases: [(&str, Bytes); 2] = [
        ("packet too short", reset_request_bytes_with_streams().slice(..8)),
        ("param too short", Bytes::from_static(&[0x0, 0xd, 0x0, 0x4])),
    ];
    for (name, binary) in cases {
        assert!(Param::unmarshal(&binary).is_err(), "expected {name} to fail");
    }
}

#[test]
fn test_param_reconfig_response_round_trip() {
    let p = Param::ReconfigResponse(ParamReconfigResponse {
        reconfig_response_sequence_number: 42,
        result: ReconfigResult::InProgress,
    });
    let raw = p.marshal().unwrap();
    assert_eq!(Param::unmarshal(&raw).unwrap(), p);
}

#[test]
fn test_reconfig_result_conversion() {
    for v in 0u32..=6 {
        assert_eq!(ReconfigResult::from(v).to_u32(), v);
    }
    assert_eq!(
        ReconfigResult::from(100),
        ReconfigResult::Unrecognized(100)
    );
}

#[test]
fn test_param_zero_checksum_round_trip() {
    let p = Param::ZeroChecksumAcceptable(ParamZeroChecksumAcceptable { edmid: 1 });
    let raw = p.marshal().unwrap();
    assert_eq!(raw.len(), 8);
    assert_eq!(u16::from_be_bytes([raw[0], raw[1]]), 0x8001);
    assert_eq!(Param::unmarshal(&raw).unwrap(), p);
}

#[test]
fn test_unknown_param_round_trip() {
    // Type 0x4009 is not one of ours; the high two bits say
    // "skip and continue", which we honor by keeping it raw.
    let raw = Bytes::from_static(&[0x40, 0x09, 0x00, 0x06, 0x01, 0x02]);
    let p = Param::unmarshal(&raw).unwrap();
    match &p {
        Param::Unknown(u) => {
            assert_eq!(u.typ, 0x4009);
            assert_eq!(&u.value[..], &[0x01, 0x02]);
        }
        other => panic!("expected unknown param, got {other}"),
    }
    assert_eq!(p.marshal().unwrap(), raw);
}
