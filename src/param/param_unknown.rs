use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// A parameter of a kind this endpoint does not implement, kept raw so it
/// round-trips untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamUnknown {
    pub typ: u16,
    pub value: Bytes,
}

impl ParamUnknown {
    pub(crate) fn value_length(&self) -> usize {
        self.value.len()
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.value);
        Ok(())
    }
}
