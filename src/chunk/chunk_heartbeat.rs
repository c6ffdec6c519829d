use bytes::{Bytes, BytesMut};

use super::chunk_type::{CT_HEARTBEAT, CT_HEARTBEAT_ACK};
use super::{marshal_params, params_length, unmarshal_params, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::Result;
use crate::param::Param;

/// HEARTBEAT carries a single heartbeat-info parameter which the ack echoes
/// back verbatim.
#[derive(Debug, Default, Clone)]
pub struct ChunkHeartbeat {
    pub params: Vec<Param>,
}

impl ChunkHeartbeat {
    pub(crate) fn value_length(&self) -> usize {
        params_length(&self.params)
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_HEARTBEAT,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        marshal_params(&self.params, buf)
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        Ok(ChunkHeartbeat {
            params: unmarshal_params(&value)?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChunkHeartbeatAck {
    pub params: Vec<Param>,
}

impl ChunkHeartbeatAck {
    pub(crate) fn value_length(&self) -> usize {
        params_length(&self.params)
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_HEARTBEAT_ACK,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        marshal_params(&self.params, buf)
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        Ok(ChunkHeartbeatAck {
            params: unmarshal_params(&value)?,
        })
    }
}
