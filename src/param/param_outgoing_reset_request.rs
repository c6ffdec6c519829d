use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const OUTGOING_RESET_REQUEST_MIN_VALUE_LENGTH: usize = 12;

/// Outgoing SSN Reset Request parameter (RFC 6525 sec 4.1): asks the peer to
/// reset the listed streams once everything up to `sender_last_tsn` has
/// arrived.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamOutgoingResetRequest {
    pub reconfig_request_sequence_number: u32,
    pub reconfig_response_sequence_number: u32,
    pub sender_last_tsn: u32,
    pub stream_identifiers: Vec<u16>,
}

impl ParamOutgoingResetRequest {
    pub(crate) fn value_length(&self) -> usize {
        OUTGOING_RESET_REQUEST_MIN_VALUE_LENGTH + self.stream_identifiers.len() * 2
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.reconfig_request_sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.reconfig_response_sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.sender_last_tsn.to_be_bytes());
        for si in &self.stream_identifiers {
            buf.extend_from_slice(&si.to_be_bytes());
        }
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        if value.len() < OUTGOING_RESET_REQUEST_MIN_VALUE_LENGTH {
            return Err(Error::ErrParamValueTooShort);
        }
        let mut stream_identifiers = vec![];
        let mut offset = OUTGOING_RESET_REQUEST_MIN_VALUE_LENGTH;
        while offset + 2 <= value.len() {
            stream_identifiers.push(u16::from_be_bytes([value[offset], value[offset + 1]]));
            offset += 2;
        }
        Ok(ParamOutgoingResetRequest {
            reconfig_request_sequence_number: u32::from_be_bytes([
                value[0], value[1], value[2], value[3],
            ]),
            reconfig_response_sequence_number: u32::from_be_bytes([
                value[4], value[5], value[6], value[7],
            ]),
            sender_last_tsn: u32::from_be_bytes([value[8], value[9], value[10], value[11]]),
            stream_identifiers,
        })
    }
}

impl fmt::Display for ParamOutgoingResetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OutgoingResetRequest rsn={} lastTSN={} streams={:?}",
            self.reconfig_request_sequence_number, self.sender_last_tsn, self.stream_identifiers,
        )
    }
}
