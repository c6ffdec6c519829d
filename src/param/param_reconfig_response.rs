use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const RECONFIG_RESPONSE_VALUE_LENGTH: usize = 8;

/// Result codes from RFC 6525 sec 4.4.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ReconfigResult {
    #[default]
    SuccessNop,
    SuccessPerformed,
    Denied,
    ErrorWrongSsn,
    ErrorRequestAlreadyInProgress,
    ErrorBadSequenceNumber,
    InProgress,
    Unrecognized(u32),
}

impl ReconfigResult {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            ReconfigResult::SuccessNop => 0,
            ReconfigResult::SuccessPerformed => 1,
            ReconfigResult::Denied => 2,
            ReconfigResult::ErrorWrongSsn => 3,
            ReconfigResult::ErrorRequestAlreadyInProgress => 4,
            ReconfigResult::ErrorBadSequenceNumber => 5,
            ReconfigResult::InProgress => 6,
            ReconfigResult::Unrecognized(v) => v,
        }
    }
}

impl From<u32> for ReconfigResult {
    fn from(v: u32) -> Self {
        match v {
            0 => ReconfigResult::SuccessNop,
            1 => ReconfigResult::SuccessPerformed,
            2 => ReconfigResult::Denied,
            3 => ReconfigResult::ErrorWrongSsn,
            4 => ReconfigResult::ErrorRequestAlreadyInProgress,
            5 => ReconfigResult::ErrorBadSequenceNumber,
            6 => ReconfigResult::InProgress,
            other => ReconfigResult::Unrecognized(other),
        }
    }
}

impl fmt::Display for ReconfigResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconfigResult::SuccessNop => "Success - Nothing to do",
            ReconfigResult::SuccessPerformed => "Success - Performed",
            ReconfigResult::Denied => "Denied",
            ReconfigResult::ErrorWrongSsn => "Error - Wrong SSN",
            ReconfigResult::ErrorRequestAlreadyInProgress => "Error - Request already in progress",
            ReconfigResult::ErrorBadSequenceNumber => "Error - Bad Sequence Number",
            ReconfigResult::InProgress => "In progress",
            ReconfigResult::Unrecognized(v) => return write!(f, "Unrecognized result: {v}"),
        };
        f.write_str(s)
    }
}

/// Re-configuration Response parameter (RFC 6525 sec 4.4).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamReconfigResponse {
    pub reconfig_response_sequence_number: u32,
    pub result: ReconfigResult,
}

impl ParamReconfigResponse {
    pub(crate) fn value_length(&self) -> usize {
        RECONFIG_RESPONSE_VALUE_LENGTH
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.reconfig_response_sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.result.to_u32().to_be_bytes());
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        if value.len() < RECONFIG_RESPONSE_VALUE_LENGTH {
            return Err(Error::ErrParamValueTooShort);
        }
        Ok(ParamReconfigResponse {
            reconfig_response_sequence_number: u32::from_be_bytes([
                value[0], value[1], value[2], value[3],
            ]),
            result: u32::from_be_bytes([value[4], value[5], value[6], value[7]]).into(),
        })
    }
}

impl fmt::Display for ParamReconfigResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReconfigResponse rsn={} result={}",
            self.reconfig_response_sequence_number, self.result,
        )
    }
}
