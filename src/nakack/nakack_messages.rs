use std::any::Any;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::message::Message;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;
use crate::seqno::Seqno;
use crate::table::missing::SeqnoRanges;
use crate::util::buf::{put_payload, try_get_payload};

pub const NAKACK_PROTOCOL_ID: ProtocolId = ProtocolId::new(b"NakAck\0\0");

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum NakAckMessageKind {
    Data = 1,
    XmitReq = 2,
    XmitFirstAvailable = 3,
    HighestSeqno = 4,
}

const FLAG_FIRST: u8 = 1;
const FLAG_XMIT: u8 = 2;
const FLAG_ORIGINAL_SENDER: u8 = 4;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NakAckMessage {
    Data(DataMessage),
    /// unicast to the original sender (or a member holding its messages)
    XmitReq {
        original_sender: NodeAddr,
        missing: SeqnoRanges,
    },
    /// the response to a request for seqnos that were purged
    XmitFirstAvailable {
        original_sender: NodeAddr,
        first: Seqno,
    },
    /// multicast by an idle sender so that loss of its last message is noticed
    HighestSeqno(Seqno),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataMessage {
    pub seqno: Seqno,
    /// marks the sender's first message, allowing receivers to create a table for it
    pub first: bool,
    pub xmit: bool,
    /// set if the message is retransmitted by a member other than the one that multicast it
    ///  originally
    pub original_sender: Option<NodeAddr>,
    pub payload: Bytes,
}

impl Message for NakAckMessage {
    fn protocol_id(&self) -> ProtocolId {
        NAKACK_PROTOCOL_ID
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            NakAckMessage::Data(data) => Self::ser_data(data, buf),
            NakAckMessage::XmitReq { original_sender, missing } => {
                original_sender.ser(buf);
                missing.ser(buf);
            }
            NakAckMessage::XmitFirstAvailable { original_sender, first } => {
                original_sender.ser(buf);
                buf.put_u64(first.to_raw());
            }
            NakAckMessage::HighestSeqno(seqno) => buf.put_u64(seqno.to_raw()),
        }
    }

    fn box_clone(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.clone())
    }
}

impl NakAckMessage {
    fn kind(&self) -> NakAckMessageKind {
        match self {
            NakAckMessage::Data(_) => NakAckMessageKind::Data,
            NakAckMessage::XmitReq { .. } => NakAckMessageKind::XmitReq,
            NakAckMessage::XmitFirstAvailable { .. } => NakAckMessageKind::XmitFirstAvailable,
            NakAckMessage::HighestSeqno(_) => NakAckMessageKind::HighestSeqno,
        }
    }

    fn ser_data(data: &DataMessage, buf: &mut BytesMut) {
        let mut flags = 0;
        if data.first {
            flags |= FLAG_FIRST;
        }
        if data.xmit {
            flags |= FLAG_XMIT;
        }
        if data.original_sender.is_some() {
            flags |= FLAG_ORIGINAL_SENDER;
        }

        buf.put_u64(data.seqno.to_raw());
        buf.put_u8(flags);
        if let Some(original_sender) = &data.original_sender {
            original_sender.ser(buf);
        }
        put_payload(buf, &data.payload);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<NakAckMessage> {
        let buf = &mut buf;
        match NakAckMessageKind::try_from_primitive(buf.try_get_u8()?)? {
            NakAckMessageKind::Data => Self::deser_data(buf),
            NakAckMessageKind::XmitReq => Ok(NakAckMessage::XmitReq {
                original_sender: NodeAddr::try_deser(buf)?,
                missing: SeqnoRanges::try_deser(buf)?,
            }),
            NakAckMessageKind::XmitFirstAvailable => Ok(NakAckMessage::XmitFirstAvailable {
                original_sender: NodeAddr::try_deser(buf)?,
                first: Seqno::from_raw(buf.try_get_u64()?),
            }),
            NakAckMessageKind::HighestSeqno => Ok(NakAckMessage::HighestSeqno(Seqno::from_raw(buf.try_get_u64()?))),
        }
    }

    fn deser_data(buf: &mut impl Buf) -> anyhow::Result<NakAckMessage> {
        let seqno = Seqno::from_raw(buf.try_get_u64()?);
        let flags = buf.try_get_u8()?;
        let original_sender = if flags & FLAG_ORIGINAL_SENDER != 0 {
            Some(NodeAddr::try_deser(buf)?)
        }
        else {
            None
        };
        let payload = try_get_payload(buf)?;

        Ok(NakAckMessage::Data(DataMessage {
            seqno,
            first: flags & FLAG_FIRST != 0,
            xmit: flags & FLAG_XMIT != 0,
            original_sender,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    fn data(seqno: u64, first: bool, xmit: bool, original_sender: Option<u16>) -> NakAckMessage {
        NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(seqno),
            first,
            xmit,
            original_sender: original_sender.map(test_node_addr_from_number),
            payload: Bytes::from_static(b"payload"),
        })
    }

    #[rstest]
    #[case::data(data(17, false, false, None), 1)]
    #[case::data_first(data(1, true, false, None), 1)]
    #[case::data_xmit_foreign(data(5, false, true, Some(3)), 1)]
    #[case::xmit_req(NakAckMessage::XmitReq {
        original_sender: test_node_addr_from_number(4),
        missing: [3, 4, 9].map(Seqno::from_raw).into_iter().collect(),
    }, 2)]
    #[case::first_available(NakAckMessage::XmitFirstAvailable { original_sender: test_node_addr_from_number(4), first: Seqno::from_raw(12) }, 3)]
    #[case::highest_seqno(NakAckMessage::HighestSeqno(Seqno::from_raw(99)), 4)]
    fn test_ser_deser(#[case] msg: NakAckMessage, #[case] kind: u8) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf[0], kind);

        let deser_msg = NakAckMessage::deser(&buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_kind(b"\x09")]
    #[case::truncated_data(b"\x01\0\0\0\0\0\0\0\x05\0\x07pay")]
    #[case::truncated_seqno(b"\x04\0\0\0")]
    fn test_deser_invalid(#[case] buf: &[u8]) {
        assert!(NakAckMessage::deser(buf).is_err());
    }
}
