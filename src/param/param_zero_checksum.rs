use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Error detection method id for lower layers that already checksum, i.e.
/// DTLS (RFC 9653).
pub(crate) const DTLS_ERROR_DETECTION_METHOD: u32 = 1;

/// Zero Checksum Acceptable parameter (RFC 9653): the sender accepts
/// incoming packets with a zero checksum because the named lower layer
/// already provides error detection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamZeroChecksumAcceptable {
    pub edmid: u32,
}

impl ParamZeroChecksumAcceptable {
    pub(crate) fn value_length(&self) -> usize {
        4
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.edmid.to_be_bytes());
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        if value.len() < 4 {
            return Err(Error::ErrParamValueTooShort);
        }
        Ok(ParamZeroChecksumAcceptable {
            edmid: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
        })
    }
}
