use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::ChunkType;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::Result;

/// A chunk of a kind this endpoint does not implement. It is kept as raw
/// bytes so the rest of the packet can still be dispatched; the handler
/// reports it as unhandled.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkUnknown {
    pub typ: u8,
    pub flags: u8,
    pub value: Bytes,
}

impl ChunkUnknown {
    pub(crate) fn value_length(&self) -> usize {
        self.value.len()
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: ChunkType(self.typ),
            flags: self.flags,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        Ok(ChunkUnknown {
            typ: header.typ.0,
            flags: header.flags,
            value: raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length()),
        })
    }
}

impl fmt::Display for ChunkUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UNKNOWN type={} len={}", self.typ, self.value.len())
    }
}
