use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::CT_ERROR;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::Result;
use crate::error_cause::{
    error_causes_length, marshal_error_causes, unmarshal_error_causes, ErrorCause,
};

/// Operational ERROR chunk; unlike ABORT it does not tear the association
/// down.
#[derive(Debug, Default, Clone)]
pub struct ChunkError {
    pub error_causes: Vec<ErrorCause>,
}

impl ChunkError {
    pub(crate) fn value_length(&self) -> usize {
        error_causes_length(&self.error_causes)
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_ERROR,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        marshal_error_causes(&self.error_causes, buf)
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        Ok(ChunkError {
            error_causes: unmarshal_error_causes(&value)?,
        })
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR")?;
        for cause in &self.error_causes {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}
