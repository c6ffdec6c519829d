use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::CT_FORWARD_TSN;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const FORWARD_TSN_MIN_LENGTH: usize = 4;

/// Per-stream entry in a FORWARD-TSN: the highest ordered SSN abandoned on
/// that stream. Unordered chunks are never listed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkForwardTsnStream {
    pub identifier: u16,
    pub sequence: u16,
}

/// FORWARD-TSN chunk (RFC 3758): tells the peer to move its cumulative TSN
/// point past abandoned chunks.
#[derive(Debug, Default, Clone)]
pub struct ChunkForwardTsn {
    pub new_cumulative_tsn: u32,
    pub streams: Vec<ChunkForwardTsnStream>,
}

impl ChunkForwardTsn {
    pub(crate) fn value_length(&self) -> usize {
        FORWARD_TSN_MIN_LENGTH + self.streams.len() * 4
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_FORWARD_TSN,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        buf.extend_from_slice(&self.new_cumulative_tsn.to_be_bytes());
        for s in &self.streams {
            buf.extend_from_slice(&s.identifier.to_be_bytes());
            buf.extend_from_slice(&s.sequence.to_be_bytes());
        }
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.value_length() < FORWARD_TSN_MIN_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let mut streams = vec![];
        let mut offset = FORWARD_TSN_MIN_LENGTH;
        while offset + 4 <= value.len() {
            streams.push(ChunkForwardTsnStream {
                identifier: u16::from_be_bytes([value[offset], value[offset + 1]]),
                sequence: u16::from_be_bytes([value[offset + 2], value[offset + 3]]),
            });
            offset += 4;
        }
        Ok(ChunkForwardTsn {
            new_cumulative_tsn: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
            streams,
        })
    }
}

impl fmt::Display for ChunkForwardTsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FORWARD-TSN newCumulativeTSN={}", self.new_cumulative_tsn)?;
        for s in &self.streams {
            write!(f, " (si={} ssn={})", s.identifier, s.sequence)?;
        }
        Ok(())
    }
}
