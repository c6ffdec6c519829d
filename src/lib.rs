//! A single-homed SCTP association endpoint over a datagram conduit.
//!
//! This crate implements the SCTP role used inside WebRTC data channels:
//! given an opaque packet-oriented byte conduit (typically DTLS over UDP),
//! it performs the four-way handshake and multiplexes multiple
//! reliable/partially-reliable ordered/unordered byte streams over that
//! conduit, with RFC 4960 congestion control, selective acknowledgement,
//! RFC 3758 partial reliability (Forward-TSN) and RFC 6525 stream
//! reconfiguration.
//!
//! The most important types are [`Association`], created with
//! [`Association::client`] or [`Association::server`] over anything
//! implementing [`PacketConn`], and [`Stream`], obtained from
//! [`Association::open_stream`] / [`Association::accept_stream`].

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use async_trait::async_trait;

pub mod association;
pub mod chunk;
pub mod config;
pub mod error;
pub mod error_cause;
pub mod packet;
pub mod param;
pub mod stream;

pub(crate) mod queue;
pub(crate) mod timer;
pub(crate) mod util;

pub use crate::association::Association;
pub use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::stream::{ReliabilityType, Stream};

/// A bidirectional packet conduit carrying one SCTP packet per datagram.
///
/// This is the association's only connection to the outside world; in WebRTC
/// it is a DTLS transport. Reads deliver exactly one packet into `buf` (up to
/// `RECEIVE_MTU` bytes); an error from `recv`, including EOF, terminates the
/// association normally.
#[async_trait]
pub trait PacketConn {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize>;
    async fn close(&self) -> std::io::Result<()>;
}
