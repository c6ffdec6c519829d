use bytes::{Bytes, BytesMut};

use super::chunk_type::{CT_SHUTDOWN, CT_SHUTDOWN_ACK, CT_SHUTDOWN_COMPLETE};
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const SHUTDOWN_VALUE_LENGTH: usize = 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkShutdown {
    pub cumulative_tsn_ack: u32,
}

impl ChunkShutdown {
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_SHUTDOWN,
            flags: 0,
            value_length: SHUTDOWN_VALUE_LENGTH as u16,
        }
        .marshal_to(buf);
        buf.extend_from_slice(&self.cumulative_tsn_ack.to_be_bytes());
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.value_length() != SHUTDOWN_VALUE_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let value = raw.slice(CHUNK_HEADER_SIZE..);
        Ok(ChunkShutdown {
            cumulative_tsn_ack: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkShutdownAck;

impl ChunkShutdownAck {
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_SHUTDOWN_ACK,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(buf);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        ChunkHeader::unmarshal(raw)?;
        Ok(ChunkShutdownAck)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkShutdownComplete;

impl ChunkShutdownComplete {
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_SHUTDOWN_COMPLETE,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(buf);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        ChunkHeader::unmarshal(raw)?;
        Ok(ChunkShutdownComplete)
    }
}
