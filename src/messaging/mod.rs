pub mod envelope;
pub mod message;
pub mod node_addr;
pub mod protocol_id;
pub mod transport;
