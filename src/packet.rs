use std::fmt;

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

use crate::chunk::chunk_type::{CT_COOKIE_ECHO, CT_INIT};
use crate::chunk::{Chunk, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::util::get_padding;

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An SCTP packet: the 12-byte common header followed by chunks, each padded
/// to a 4-byte boundary (RFC 4960 sec 3).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Source Port Number        |   Destination Port Number     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Verification Tag                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Checksum                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone)]
pub struct Packet {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    /// Parses a packet. `do_checksum` forces CRC verification; it is also
    /// performed whenever the received checksum field is nonzero or the
    /// first chunk is INIT or COOKIE-ECHO, which must always be covered.
    pub(crate) fn unmarshal(do_checksum: bool, raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let mut do_checksum = do_checksum;
        if PACKET_HEADER_SIZE + CHUNK_HEADER_SIZE <= raw.len() {
            match crate::chunk::chunk_type::ChunkType(raw[PACKET_HEADER_SIZE]) {
                CT_INIT | CT_COOKIE_ECHO => do_checksum = true,
                _ => {}
            }
        }
        let their_checksum = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if their_checksum != 0 || do_checksum {
            let our_checksum = generate_packet_checksum(raw);
            if their_checksum != our_checksum {
                return Err(Error::ErrChecksumMismatch);
            }
        }

        let mut chunks = vec![];
        let mut offset = PACKET_HEADER_SIZE;
        loop {
            if offset == raw.len() {
                break;
            } else if offset + CHUNK_HEADER_SIZE > raw.len() {
                return Err(Error::ErrParseSctpChunkNotEnoughData);
            }
            let chunk = Chunk::unmarshal(&raw.slice(offset..))?;
            let value_length = chunk.value_length();
            offset += CHUNK_HEADER_SIZE + value_length + get_padding(value_length);
            chunks.push(chunk);
        }

        Ok(Packet {
            source_port: u16::from_be_bytes([raw[0], raw[1]]),
            destination_port: u16::from_be_bytes([raw[2], raw[3]]),
            verification_tag: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            chunks,
        })
    }

    pub(crate) fn marshal(&self, do_checksum: bool) -> Result<Bytes> {
        let mut raw = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        raw.extend_from_slice(&self.source_port.to_be_bytes());
        raw.extend_from_slice(&self.destination_port.to_be_bytes());
        raw.extend_from_slice(&self.verification_tag.to_be_bytes());
        // Checksum field stays zero until the packet is complete.
        raw.extend_from_slice(&[0u8; 4]);

        for c in &self.chunks {
            c.marshal_to(&mut raw)?;
            let padding = get_padding(raw.len());
            raw.extend_from_slice(&[0u8; 3][..padding]);
        }

        if do_checksum {
            // The CRC32C digest is reflected, so writing it in little-endian
            // byte order yields the order the wire format expects.
            let checksum = generate_packet_checksum(&raw).to_le_bytes();
            raw[8..12].copy_from_slice(&checksum);
        }

        Ok(raw.freeze())
    }

    /// Packet-level validation applied to every inbound packet.
    pub(crate) fn check(&self) -> Result<()> {
        // Port number 0 MUST NOT be used in either direction.
        if self.source_port == 0 {
            return Err(Error::ErrSctpPacketSourcePortZero);
        }
        if self.destination_port == 0 {
            return Err(Error::ErrSctpPacketDestinationPortZero);
        }

        for c in &self.chunks {
            if let Chunk::Init(_) = c {
                // An INIT chunk MUST be the only chunk in its packet, and
                // that packet MUST carry a zero verification tag.
                if self.chunks.len() != 1 {
                    return Err(Error::ErrInitChunkBundled);
                }
                if self.verification_tag != 0 {
                    return Err(Error::ErrInitChunkVerifyTagNotZero);
                }
            }
        }
        Ok(())
    }
}

/// CRC32C over the packet with the checksum field treated as zero.
pub(crate) fn generate_packet_checksum(raw: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&raw[0..8]);
    digest.update(&[0u8; 4]);
    digest.update(&raw[12..]);
    digest.finalize()
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet source_port={} destination_port={} verification_tag={}",
            self.source_port, self.destination_port, self.verification_tag,
        )?;
        for (i, c) in self.chunks.iter().enumerate() {
            write!(f, "\n chunk {i}: {c}")?;
        }
        Ok(())
    }
}
