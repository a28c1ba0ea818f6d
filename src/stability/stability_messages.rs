use std::any::Any;

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::digest::Digest;
use crate::messaging::message::Message;
use crate::messaging::protocol_id::ProtocolId;

pub const STABLE_PROTOCOL_ID: ProtocolId = ProtocolId::new(b"Stable\0\0");

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum StabilityMessageKind {
    StableRequest = 1,
    Stable = 2,
    Stability = 3,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StabilityMessage {
    /// multicast by the driver to start a round
    StableRequest {
        view_id: u64,
        round: u64,
    },
    /// a member's vote, unicast to the driver. Round 0 marks a vote that was not requested.
    Stable {
        view_id: u64,
        round: u64,
        digest: Digest,
    },
    /// the result of a round, multicast by the driver
    Stability {
        view_id: u64,
        digest: Digest,
    },
}

impl Message for StabilityMessage {
    fn protocol_id(&self) -> ProtocolId {
        STABLE_PROTOCOL_ID
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            StabilityMessage::StableRequest { view_id, round } => {
                buf.put_u64(*view_id);
                buf.put_u64(*round);
            }
            StabilityMessage::Stable { view_id, round, digest } => {
                buf.put_u64(*view_id);
                buf.put_u64(*round);
                digest.ser(buf);
            }
            StabilityMessage::Stability { view_id, digest } => {
                buf.put_u64(*view_id);
                digest.ser(buf);
            }
        }
    }

    fn box_clone(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.clone())
    }
}

impl StabilityMessage {
    fn kind(&self) -> StabilityMessageKind {
        match self {
            StabilityMessage::StableRequest { .. } => StabilityMessageKind::StableRequest,
            StabilityMessage::Stable { .. } => StabilityMessageKind::Stable,
            StabilityMessage::Stability { .. } => StabilityMessageKind::Stability,
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<StabilityMessage> {
        let buf = &mut buf;
        match StabilityMessageKind::try_from_primitive(buf.try_get_u8()?)? {
            StabilityMessageKind::StableRequest => Ok(StabilityMessage::StableRequest {
                view_id: buf.try_get_u64()?,
                round: buf.try_get_u64()?,
            }),
            StabilityMessageKind::Stable => Ok(StabilityMessage::Stable {
                view_id: buf.try_get_u64()?,
                round: buf.try_get_u64()?,
                digest: Digest::try_deser(buf)?,
            }),
            StabilityMessageKind::Stability => Ok(StabilityMessage::Stability {
                view_id: buf.try_get_u64()?,
                digest: Digest::try_deser(buf)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::seqno::Seqno;
    use crate::table::Watermarks;
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    fn digest() -> Digest {
        [
            (test_node_addr_from_number(1), Watermarks::new(Seqno::from_raw(3), Seqno::from_raw(5), Seqno::from_raw(9))),
            (test_node_addr_from_number(2), Watermarks::at(Seqno::ZERO)),
        ].into_iter().collect()
    }

    #[rstest]
    #[case::stable_request(StabilityMessage::StableRequest { view_id: 4, round: 17 })]
    #[case::stable(StabilityMessage::Stable { view_id: 4, round: 17, digest: digest() })]
    #[case::unsolicited_stable(StabilityMessage::Stable { view_id: 4, round: 0, digest: Digest::default() })]
    #[case::stability(StabilityMessage::Stability { view_id: 5, digest: digest() })]
    fn test_ser_deser(#[case] msg: StabilityMessage) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(StabilityMessage::deser(&buf).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_kind(b"\x07")]
    #[case::truncated(b"\x01\0\0\0\0\0\0\0\x01\0\0")]
    fn test_deser_invalid(#[case] buf: &[u8]) {
        assert!(StabilityMessage::deser(buf).is_err());
    }
}
