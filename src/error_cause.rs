use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::get_padding;

pub(crate) const ERROR_CAUSE_HEADER_LENGTH: usize = 4;

/// Cause code carried by ERROR and ABORT chunks (RFC 4960 sec 3.3.10).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ErrorCauseCode(pub u16);

pub const UNRECOGNIZED_CHUNK_TYPE: ErrorCauseCode = ErrorCauseCode(6);
pub const USER_INITIATED_ABORT: ErrorCauseCode = ErrorCauseCode(12);
pub const PROTOCOL_VIOLATION: ErrorCauseCode = ErrorCauseCode(13);

impl fmt::Display for ErrorCauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            UNRECOGNIZED_CHUNK_TYPE => "Unrecognized Chunk Type",
            USER_INITIATED_ABORT => "User Initiated Abort",
            PROTOCOL_VIOLATION => "Protocol Violation",
            _ => return write!(f, "Unknown CauseCode: {}", self.0),
        };
        f.write_str(s)
    }
}

/// A single error cause: code plus cause-specific information, kept raw.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: ErrorCauseCode,
    pub raw: Bytes,
}

impl ErrorCause {
    pub(crate) fn user_initiated_abort(reason: Bytes) -> Self {
        ErrorCause {
            code: USER_INITIATED_ABORT,
            raw: reason,
        }
    }

    pub(crate) fn unrecognized_chunk_type() -> Self {
        ErrorCause {
            code: UNRECOGNIZED_CHUNK_TYPE,
            raw: Bytes::new(),
        }
    }

    pub(crate) fn protocol_violation(info: Bytes) -> Self {
        ErrorCause {
            code: PROTOCOL_VIOLATION,
            raw: info,
        }
    }

    /// Wire length excluding padding.
    pub(crate) fn length(&self) -> usize {
        ERROR_CAUSE_HEADER_LENGTH + self.raw.len()
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.code.0.to_be_bytes());
        buf.extend_from_slice(&(self.length() as u16).to_be_bytes());
        buf.extend_from_slice(&self.raw);
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < ERROR_CAUSE_HEADER_LENGTH {
            return Err(Error::ErrErrorCauseTooShort);
        }
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if length < ERROR_CAUSE_HEADER_LENGTH || raw.len() < length {
            return Err(Error::ErrErrorCauseTooShort);
        }
        Ok(ErrorCause {
            code: ErrorCauseCode(u16::from_be_bytes([raw[0], raw[1]])),
            raw: raw.slice(ERROR_CAUSE_HEADER_LENGTH..length),
        })
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            USER_INITIATED_ABORT | PROTOCOL_VIOLATION if !self.raw.is_empty() => {
                write!(f, "{}: {}", self.code, String::from_utf8_lossy(&self.raw))
            }
            _ => write!(f, "{}", self.code),
        }
    }
}

/// Causes are packed like parameters: every cause padded to 4 bytes except
/// the last.
pub(crate) fn error_causes_length(causes: &[ErrorCause]) -> usize {
    let mut length = 0;
    for (idx, c) in causes.iter().enumerate() {
        length += c.length();
        if idx != causes.len() - 1 {
            length += get_padding(c.length());
        }
    }
    length
}

pub(crate) fn marshal_error_causes(causes: &[ErrorCause], buf: &mut BytesMut) -> Result<()> {
    for (idx, c) in causes.iter().enumerate() {
        c.marshal_to(buf);
        if idx != causes.len() - 1 {
            buf.extend_from_slice(&[0u8; 3][..get_padding(c.length())]);
        }
    }
    Ok(())
}

pub(crate) fn unmarshal_error_causes(raw: &Bytes) -> Result<Vec<ErrorCause>> {
    let mut causes = vec![];
    let mut offset = 0;
    while offset + ERROR_CAUSE_HEADER_LENGTH <= raw.len() {
        let c = ErrorCause::unmarshal(&raw.slice(offset..))?;
        offset += c.length() + get_padding(c.length());
        causes.push(c);
    }
    Ok(causes)
}
