//! Loss repair: the sender-side buffer that answers retransmission requests, and the
//!  receiver-side tracking of gaps that decides when to send them.

pub mod backoff;
pub mod gap_tracker;
pub mod send_buffer;
