use std::sync::atomic::{AtomicU64, Ordering};

/// Association-lifetime counters, dumped at debug level on close.
#[derive(Debug, Default)]
pub(crate) struct AssociationStats {
    n_packets_received: AtomicU64,
    n_packets_sent: AtomicU64,
    n_datas: AtomicU64,
    n_sacks_received: AtomicU64,
    n_sacks_sent: AtomicU64,
    n_t3timeouts: AtomicU64,
    n_ack_timeouts: AtomicU64,
    n_fast_retrans: AtomicU64,
}

impl AssociationStats {
    pub(crate) fn inc_packets_received(&self) {
        self.n_packets_received.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_packets_received(&self) -> u64 {
        self.n_packets_received.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_packets_sent(&self) {
        self.n_packets_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_packets_sent(&self) -> u64 {
        self.n_packets_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_datas(&self) {
        self.n_datas.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_datas(&self) -> u64 {
        self.n_datas.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_sacks_received(&self) {
        self.n_sacks_received.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_sacks_received(&self) -> u64 {
        self.n_sacks_received.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_sacks_sent(&self) {
        self.n_sacks_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_sacks_sent(&self) -> u64 {
        self.n_sacks_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_t3timeouts(&self) {
        self.n_t3timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_t3timeouts(&self) -> u64 {
        self.n_t3timeouts.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_ack_timeouts(&self) {
        self.n_ack_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_ack_timeouts(&self) -> u64 {
        self.n_ack_timeouts.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_fast_retrans(&self) {
        self.n_fast_retrans.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get_num_fast_retrans(&self) -> u64 {
        self.n_fast_retrans.load(Ordering::SeqCst)
    }
}
