use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(from: NodeAddr, protocol_id: ProtocolId, msg: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&from.unique.to_be_bytes());
        digest.update(&protocol_id.0.to_be_bytes());
        digest.update(msg);

        Checksum(digest.finalize())
    }
}

/// The header in front of every message on the wire. Multicast and unicast messages share the
///  same envelope, so it carries no target address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub from: NodeAddr,
    pub checksum: Checksum,
    pub protocol_id: ProtocolId,
}
impl Envelope {
    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let from = NodeAddr::try_deser(buf)?;
        let checksum = Checksum(buf.try_get_u64()?);
        let protocol_id = ProtocolId(buf.try_get_u64()?);

        Ok(Envelope {
            from,
            checksum,
            protocol_id,
        })
    }

    pub fn write(from: NodeAddr, checksum: Checksum, protocol_id: ProtocolId, buf: &mut BytesMut) {
        from.ser(buf);
        buf.put_u64(checksum.0);
        buf.put_u64(protocol_id.0);
    }

    /// checks the envelope's checksum against the message that follows it
    pub fn is_valid_for(&self, msg: &[u8]) -> bool {
        self.checksum == Checksum::new(self.from, self.protocol_id, msg)
    }
}
