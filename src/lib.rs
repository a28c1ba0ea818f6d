//! Reliable, ordered delivery of messages within a group of processes on top of a transport that
//!  may lose, duplicate or reorder messages.
//!
//! Every sender numbers its messages with consecutive [seqno::Seqno]s, and every receiver keeps a
//!  [table::SeqnoTable] per sender that delivers messages in order and reveals gaps. Gaps are
//!  repaired by negative acknowledgements (retransmission requests), and a distributed stability
//!  protocol determines when buffered messages were delivered everywhere and can be dropped.
//!
//! ```ascii
//! sender                                   receiver
//!   multicast(m) -> seqno 7                  table[sender]: ..5 6 _ 8
//!   retransmit buffer [..7]  <-- XMIT_REQ 7 ---- gap tracker
//!                            --- DATA 7 (xmit) -->     deliver 7, 8
//!
//!   stability: min(highest delivered) over all members  -->  purge buffers and tables
//! ```
//!
//! [group::Group] is the entry point, assembling the protocol layers configured in
//!  [config::GroupConfig].

pub mod config;
pub mod delivery;
pub mod digest;
pub mod error;
pub mod flow_control;
pub mod group;
pub mod membership;
pub mod messaging;
pub mod nakack;
pub mod receive_window;
pub mod retransmit;
pub mod seqno;
pub mod stability;
pub mod stack;
pub mod stats;
pub mod table;
pub mod test_util;
pub mod unicast;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
