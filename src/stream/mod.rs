use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::association::AssociationState;
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::queue::pending_queue::PendingQueue;
use crate::queue::reassembly_queue::ReassemblyQueue;

#[cfg(test)]
mod stream_test;

/// How a stream bounds retransmission of its messages (PR-SCTP, RFC 3758).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReliabilityType {
    /// Ordinary reliable transmission.
    #[default]
    Reliable = 0,
    /// Give up after `reliability_value` transmissions.
    Rexmit = 1,
    /// Give up `reliability_value` milliseconds after the first send.
    Timed = 2,
}

impl From<u8> for ReliabilityType {
    fn from(v: u8) -> Self {
        match v {
            1 => ReliabilityType::Rexmit,
            2 => ReliabilityType::Timed,
            _ => ReliabilityType::Reliable,
        }
    }
}

pub type OnBufferedAmountLowFn = Box<dyn Fn() + Send + Sync>;

/// One SCTP stream: a sequence of user messages multiplexed over the
/// association.
///
/// A stream does not hold a reference back to the association; it shares the
/// association's pending queue, state flag and write-loop wake channel, so
/// writes go straight to the send path and no ownership cycle forms.
pub struct Stream {
    pub(crate) stream_identifier: u16,
    pub(crate) name: String,

    pub(crate) max_payload_size: u32,
    pub(crate) max_message_size: Arc<AtomicU32>,
    pub(crate) association_state: Arc<AtomicU8>,
    pub(crate) awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    pub(crate) pending_queue: Arc<PendingQueue>,

    pub(crate) block_write: bool,
    pub(crate) write_pending: Arc<AtomicBool>,
    pub(crate) write_notify: Arc<Notify>,

    pub(crate) default_payload_type: AtomicU32,
    pub(crate) sequence_number: AtomicU16,
    pub(crate) reassembly_queue: Mutex<ReassemblyQueue>,
    pub(crate) read_notifier: Notify,
    pub(crate) read_err: Mutex<Option<Error>>,
    pub(crate) closed: AtomicBool,

    pub(crate) unordered: AtomicBool,
    pub(crate) reliability_type: AtomicU8,
    pub(crate) reliability_value: AtomicU32,

    pub(crate) buffered_amount: AtomicUsize,
    pub(crate) buffered_amount_low: AtomicUsize,
    pub(crate) on_buffered_amount_low: Mutex<Option<OnBufferedAmountLowFn>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_identifier", &self.stream_identifier)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Stream {
    /// Returns the stream identifier.
    pub fn stream_identifier(&self) -> u16 {
        self.stream_identifier
    }

    /// Sets the payload type used by `write`.
    pub fn set_default_payload_type(&self, default_payload_type: PayloadProtocolIdentifier) {
        self.default_payload_type
            .store(default_payload_type as u32, Ordering::SeqCst);
    }

    pub fn default_payload_type(&self) -> PayloadProtocolIdentifier {
        self.default_payload_type.load(Ordering::SeqCst).into()
    }

    /// Configures ordering and partial reliability. Effective for messages
    /// written after the call.
    pub fn set_reliability_params(
        &self,
        unordered: bool,
        rel_type: ReliabilityType,
        rel_value: u32,
    ) {
        log::debug!(
            "[{}] reliability params: ordered={} type={:?} value={}",
            self.name,
            !unordered,
            rel_type,
            rel_value
        );
        self.unordered.store(unordered, Ordering::SeqCst);
        self.reliability_type.store(rel_type as u8, Ordering::SeqCst);
        self.reliability_value.store(rel_value, Ordering::SeqCst);
    }

    pub(crate) fn reliability_type(&self) -> ReliabilityType {
        self.reliability_type.load(Ordering::SeqCst).into()
    }

    pub(crate) fn reliability_value(&self) -> u32 {
        self.reliability_value.load(Ordering::SeqCst)
    }

    /// Reads the next whole message into `buf`, discarding the payload
    /// protocol identifier.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.read_sctp(buf).await?;
        Ok(n)
    }

    /// Reads the next whole message into `buf`, returning its length and
    /// payload protocol identifier. Waits until a complete message is
    /// available or the stream closes.
    pub async fn read_sctp(&self, buf: &mut [u8]) -> Result<(usize, PayloadProtocolIdentifier)> {
        loop {
            let result = {
                let mut rq = self.reassembly_queue.lock().unwrap();
                rq.read(buf)
            };
            match result {
                Some(r) => return r,
                None => {
                    if self.closed.load(Ordering::SeqCst) {
                        let err = self.read_err.lock().unwrap().clone();
                        return Err(err.unwrap_or(Error::ErrStreamClosed));
                    }
                    self.read_notifier.notified().await;
                }
            }
        }
    }

    /// Writes `p` as one message with the stream's default payload type.
    pub async fn write(&self, p: &Bytes) -> Result<usize> {
        self.write_sctp(p, self.default_payload_type()).await
    }

    /// Writes `p` as one message with the given payload type, fragmenting
    /// to the path MTU. With `block_write` configured this waits until the
    /// previous batch has drained from the pending queue.
    pub async fn write_sctp(
        &self,
        p: &Bytes,
        ppi: PayloadProtocolIdentifier,
    ) -> Result<usize> {
        if p.is_empty() {
            // A zero-length DATA chunk is the internal end-of-stream
            // sentinel; nothing to send.
            return Ok(0);
        }
        if p.len() > self.max_message_size.load(Ordering::SeqCst) as usize {
            return Err(Error::ErrOutboundPacketTooLarge);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrStreamClosed);
        }
        if AssociationState::from(self.association_state.load(Ordering::SeqCst))
            != AssociationState::Established
        {
            return Err(Error::ErrPayloadDataStateNotExist);
        }

        if self.block_write {
            while self.write_pending.swap(true, Ordering::SeqCst) {
                self.write_notify.notified().await;
                if self.closed.load(Ordering::SeqCst) {
                    return Err(Error::ErrStreamClosed);
                }
            }
        }

        let chunks = self.packetize(p, ppi);
        for c in chunks {
            self.pending_queue.push(c);
        }
        self.buffered_amount.fetch_add(p.len(), Ordering::SeqCst);
        self.awake_write_loop();
        Ok(p.len())
    }

    fn packetize(&self, raw: &Bytes, ppi: PayloadProtocolIdentifier) -> Vec<ChunkPayloadData> {
        // DCEP messages ride ordered and reliable no matter how the stream
        // is configured.
        let unordered = ppi != PayloadProtocolIdentifier::Dcep && self.unordered.load(Ordering::SeqCst);
        let ssn = self.sequence_number.load(Ordering::SeqCst);

        let mut chunks: Vec<ChunkPayloadData> = vec![];
        let mut i = 0;
        let mut remaining = raw.len();
        let mut shared_state = None;
        while remaining != 0 {
            let fragment_size = std::cmp::min(self.max_payload_size as usize, remaining);
            let mut chunk = ChunkPayloadData {
                stream_identifier: self.stream_identifier,
                user_data: raw.slice(i..i + fragment_size),
                unordered,
                beginning_fragment: i == 0,
                stream_sequence_number: ssn,
                payload_type: ppi,
                ..Default::default()
            };
            if let Some(state) = shared_state.clone() {
                chunk = chunk.with_shared_state(state);
            } else {
                shared_state = Some(chunk.sibling());
            }
            chunks.push(chunk);
            remaining -= fragment_size;
            i += fragment_size;
        }
        chunks.last_mut().unwrap().ending_fragment = true;

        if !unordered {
            self.sequence_number
                .store(ssn.wrapping_add(1), Ordering::SeqCst);
        }
        chunks
    }

    /// Closes the write direction by queueing an outgoing stream reset.
    /// Reads unblock with an error once buffered messages are drained.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.read_notifier.notify_one();
        self.read_notifier.notify_waiters();

        if AssociationState::from(self.association_state.load(Ordering::SeqCst))
            != AssociationState::Established
        {
            return Err(Error::ErrResetPacketInStateNotExist);
        }

        // An empty-payload chunk is the end-of-stream sentinel; the write
        // loop turns it into an outgoing reset request.
        let c = ChunkPayloadData {
            stream_identifier: self.stream_identifier,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::new(),
            ..Default::default()
        };
        self.pending_queue.push(c);
        self.awake_write_loop();
        Ok(())
    }

    /// Total bytes of user data queued or in flight for this stream.
    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.buffered_amount_low.load(Ordering::SeqCst)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low.store(threshold, Ordering::SeqCst);
    }

    /// Registers a callback invoked when the buffered amount drops at or
    /// below the configured threshold.
    pub fn on_buffered_amount_low(&self, f: OnBufferedAmountLowFn) {
        *self.on_buffered_amount_low.lock().unwrap() = Some(f);
    }

    fn awake_write_loop(&self) {
        let _ = self.awake_write_loop_ch.try_send(());
    }

    // Association-side hooks below. All are synchronous and touch only this
    // stream's own state, so the association may call them under its lock.

    pub(crate) fn handle_data(&self, pd: &ChunkPayloadData) {
        let readable = {
            let mut rq = self.reassembly_queue.lock().unwrap();
            rq.push(pd.clone())
        };
        if readable {
            self.read_notifier.notify_one();
        }
    }

    pub(crate) fn handle_forward_tsn_for_ordered(&self, ssn: u16) {
        if self.unordered.load(Ordering::SeqCst) {
            return;
        }
        let readable = {
            let mut rq = self.reassembly_queue.lock().unwrap();
            rq.forward_tsn_for_ordered(ssn);
            rq.is_readable()
        };
        if readable {
            self.read_notifier.notify_one();
        }
    }

    pub(crate) fn handle_forward_tsn_for_unordered(&self, new_cumulative_tsn: u32) {
        let readable = {
            let mut rq = self.reassembly_queue.lock().unwrap();
            rq.forward_tsn_for_unordered(new_cumulative_tsn);
            rq.is_readable()
        };
        if readable {
            self.read_notifier.notify_one();
        }
    }

    pub(crate) fn get_num_bytes_in_reassembly_queue(&self) -> usize {
        self.reassembly_queue.lock().unwrap().get_num_bytes()
    }

    /// Called from SACK processing when the peer acknowledged `n_bytes` of
    /// this stream's data.
    pub(crate) fn on_buffer_released(&self, n_bytes_released: usize) {
        if n_bytes_released == 0 {
            return;
        }
        let from = self.buffered_amount.load(Ordering::SeqCst);
        let to = from.saturating_sub(n_bytes_released);
        self.buffered_amount.store(to, Ordering::SeqCst);

        let threshold = self.buffered_amount_low.load(Ordering::SeqCst);
        if from > threshold && to <= threshold {
            if let Some(f) = &*self.on_buffered_amount_low.lock().unwrap() {
                f();
            }
        }
    }

    /// The peer reset this stream; no more data will arrive.
    pub(crate) fn on_inbound_stream_reset(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.read_notifier.notify_one();
        self.read_notifier.notify_waiters();
    }

    /// Removes the stream from service when the association goes down.
    pub(crate) fn unregister(&self, err: Option<Error>) {
        *self.read_err.lock().unwrap() = err;
        self.closed.store(true, Ordering::SeqCst);
        self.read_notifier.notify_one();
        self.read_notifier.notify_waiters();
    }
}
