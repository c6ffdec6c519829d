use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::chunk::chunk_payload_data::ChunkPayloadData;

/// The pending queue: unsent DATA chunks in user submission order.
///
/// Streams push into it directly and the association drains it from the
/// write loop, so it carries its own interior locking instead of living
/// under the association mutex. Ordered and unordered chunks sit in separate
/// FIFOs; once a fragmented message has been started, its remaining
/// fragments are selected ahead of everything else so fragments of one
/// message always leave contiguously.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    unordered_queue: Mutex<VecDeque<ChunkPayloadData>>,
    ordered_queue: Mutex<VecDeque<ChunkPayloadData>>,
    queue_len: AtomicUsize,
    n_bytes: AtomicUsize,
    selected: AtomicBool,
    unordered_is_selected: AtomicBool,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        PendingQueue::default()
    }

    pub(crate) fn push(&self, c: ChunkPayloadData) {
        self.n_bytes.fetch_add(c.user_data.len(), Ordering::SeqCst);
        if c.unordered {
            let mut q = self.unordered_queue.lock().unwrap();
            q.push_back(c);
        } else {
            let mut q = self.ordered_queue.lock().unwrap();
            q.push_back(c);
        }
        self.queue_len.fetch_add(1, Ordering::SeqCst);
    }

    /// A clone of the chunk `pop` would remove next. The caller inspects it,
    /// decides, then pops with the clone's fragment coordinates.
    pub(crate) fn peek(&self) -> Option<ChunkPayloadData> {
        if self.selected.load(Ordering::SeqCst) {
            if self.unordered_is_selected.load(Ordering::SeqCst) {
                self.unordered_queue.lock().unwrap().front().cloned()
            } else {
                self.ordered_queue.lock().unwrap().front().cloned()
            }
        } else {
            let c = self.unordered_queue.lock().unwrap().front().cloned();
            if c.is_some() {
                return c;
            }
            self.ordered_queue.lock().unwrap().front().cloned()
        }
    }

    pub(crate) fn pop(&self, beginning_fragment: bool, unordered: bool) -> Option<ChunkPayloadData> {
        let popped = if self.selected.load(Ordering::SeqCst) {
            let popped = if self.unordered_is_selected.load(Ordering::SeqCst) {
                self.unordered_queue.lock().unwrap().pop_front()
            } else {
                self.ordered_queue.lock().unwrap().pop_front()
            };
            if let Some(p) = &popped {
                if p.ending_fragment {
                    self.selected.store(false, Ordering::SeqCst);
                }
            }
            popped
        } else {
            if !beginning_fragment {
                // Never start draining mid-message.
                return None;
            }
            let popped = if unordered {
                self.unordered_queue.lock().unwrap().pop_front()
            } else {
                self.ordered_queue.lock().unwrap().pop_front()
            };
            if let Some(p) = &popped {
                if !p.ending_fragment {
                    self.selected.store(true, Ordering::SeqCst);
                    self.unordered_is_selected.store(unordered, Ordering::SeqCst);
                }
            }
            popped
        };
        if let Some(p) = &popped {
            self.n_bytes.fetch_sub(p.user_data.len(), Ordering::SeqCst);
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
