use bytes::{Bytes, BytesMut};

use crate::chunk::chunk_type::ChunkType;
use crate::error::Result;

/// Supported Extensions parameter (RFC 5061 sec 4.2.7): the chunk types this
/// endpoint understands beyond the base protocol.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamSupportedExtensions {
    pub chunk_types: Vec<ChunkType>,
}

impl ParamSupportedExtensions {
    pub(crate) fn value_length(&self) -> usize {
        self.chunk_types.len()
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        for ct in &self.chunk_types {
            buf.extend_from_slice(&[ct.0]);
        }
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        Ok(ParamSupportedExtensions {
            chunk_types: value.iter().map(|b| ChunkType(*b)).collect(),
        })
    }
}
