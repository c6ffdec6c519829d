use bytes::{Bytes, BytesMut};

use crate::error::Result;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamHeartbeatInfo {
    pub heartbeat_information: Bytes,
}

impl ParamHeartbeatInfo {
    pub(crate) fn value_length(&self) -> usize {
        self.heartbeat_information.len()
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.heartbeat_information);
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        Ok(ParamHeartbeatInfo {
            heartbeat_information: value.clone(),
        })
    }
}
