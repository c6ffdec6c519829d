pub(crate) mod payload_queue;
pub(crate) mod pending_queue;
pub(crate) mod reassembly_queue;
pub(crate) mod receive_payload_queue;

#[cfg(test)]
mod queue_test;
