use std::any::Any;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::message::Message;
use crate::messaging::protocol_id::ProtocolId;
use crate::seqno::Seqno;
use crate::table::missing::SeqnoRanges;
use crate::util::buf::{put_bool, put_payload, try_get_bool, try_get_payload};

pub const UNICAST_PROTOCOL_ID: ProtocolId = ProtocolId::new(b"Unicast\0");

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum UnicastMessageKind {
    Data = 1,
    Ack = 2,
    XmitReq = 3,
    XmitFirstAvailable = 4,
    SendFirstSeqno = 5,
}

/// Every message carries the id of the connection it belongs to. A sender starts a new
///  connection (with seqnos starting at 1) when it has no state for a peer, e.g. after a restart.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UnicastMessage {
    Data {
        seqno: Seqno,
        conn_id: u16,
        /// the receiver may start a new connection with this message
        first: bool,
        xmit: bool,
        payload: Bytes,
    },
    /// everything up to and including `seqno` was delivered
    Ack {
        seqno: Seqno,
        conn_id: u16,
    },
    XmitReq {
        conn_id: u16,
        missing: SeqnoRanges,
    },
    XmitFirstAvailable {
        conn_id: u16,
        first: Seqno,
    },
    /// sent by a receiver that got a message for a connection it does not know
    SendFirstSeqno {
        conn_id: u16,
    },
}

impl Message for UnicastMessage {
    fn protocol_id(&self) -> ProtocolId {
        UNICAST_PROTOCOL_ID
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            UnicastMessage::Data { seqno, conn_id, first, xmit, payload } => {
                buf.put_u64(seqno.to_raw());
                buf.put_u16(*conn_id);
                put_bool(buf, *first);
                put_bool(buf, *xmit);
                put_payload(buf, payload);
            }
            UnicastMessage::Ack { seqno, conn_id } => {
                buf.put_u64(seqno.to_raw());
                buf.put_u16(*conn_id);
            }
            UnicastMessage::XmitReq { conn_id, missing } => {
                buf.put_u16(*conn_id);
                missing.ser(buf);
            }
            UnicastMessage::XmitFirstAvailable { conn_id, first } => {
                buf.put_u16(*conn_id);
                buf.put_u64(first.to_raw());
            }
            UnicastMessage::SendFirstSeqno { conn_id } => {
                buf.put_u16(*conn_id);
            }
        }
    }

    fn box_clone(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.clone())
    }
}

impl UnicastMessage {
    fn kind(&self) -> UnicastMessageKind {
        match self {
            UnicastMessage::Data { .. } => UnicastMessageKind::Data,
            UnicastMessage::Ack { .. } => UnicastMessageKind::Ack,
            UnicastMessage::XmitReq { .. } => UnicastMessageKind::XmitReq,
            UnicastMessage::XmitFirstAvailable { .. } => UnicastMessageKind::XmitFirstAvailable,
            UnicastMessage::SendFirstSeqno { .. } => UnicastMessageKind::SendFirstSeqno,
        }
    }

    pub fn conn_id(&self) -> u16 {
        match self {
            UnicastMessage::Data { conn_id, .. } => *conn_id,
            UnicastMessage::Ack { conn_id, .. } => *conn_id,
            UnicastMessage::XmitReq { conn_id, .. } => *conn_id,
            UnicastMessage::XmitFirstAvailable { conn_id, .. } => *conn_id,
            UnicastMessage::SendFirstSeqno { conn_id } => *conn_id,
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<UnicastMessage> {
        let buf = &mut buf;
        match UnicastMessageKind::try_from_primitive(buf.try_get_u8()?)? {
            UnicastMessageKind::Data => Ok(UnicastMessage::Data {
                seqno: Seqno::from_raw(buf.try_get_u64()?),
                conn_id: buf.try_get_u16()?,
                first: try_get_bool(buf)?,
                xmit: try_get_bool(buf)?,
                payload: try_get_payload(buf)?,
            }),
            UnicastMessageKind::Ack => Ok(UnicastMessage::Ack {
                seqno: Seqno::from_raw(buf.try_get_u64()?),
                conn_id: buf.try_get_u16()?,
            }),
            UnicastMessageKind::XmitReq => Ok(UnicastMessage::XmitReq {
                conn_id: buf.try_get_u16()?,
                missing: SeqnoRanges::try_deser(buf)?,
            }),
            UnicastMessageKind::XmitFirstAvailable => Ok(UnicastMessage::XmitFirstAvailable {
                conn_id: buf.try_get_u16()?,
                first: Seqno::from_raw(buf.try_get_u64()?),
            }),
            UnicastMessageKind::SendFirstSeqno => Ok(UnicastMessage::SendFirstSeqno {
                conn_id: buf.try_get_u16()?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::data(UnicastMessage::Data { seqno: Seqno::from_raw(3), conn_id: 7, first: false, xmit: false, payload: Bytes::from_static(b"abc") }, 1)]
    #[case::data_first_xmit(UnicastMessage::Data { seqno: Seqno::FIRST, conn_id: 65535, first: true, xmit: true, payload: Bytes::new() }, 1)]
    #[case::ack(UnicastMessage::Ack { seqno: Seqno::from_raw(99), conn_id: 2 }, 2)]
    #[case::xmit_req(UnicastMessage::XmitReq { conn_id: 2, missing: [4, 5, 8].map(Seqno::from_raw).into_iter().collect() }, 3)]
    #[case::first_available(UnicastMessage::XmitFirstAvailable { conn_id: 2, first: Seqno::from_raw(12) }, 4)]
    #[case::send_first_seqno(UnicastMessage::SendFirstSeqno { conn_id: 9 }, 5)]
    fn test_ser_deser(#[case] msg: UnicastMessage, #[case] kind: u8) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf[0], kind);
        assert_eq!(UnicastMessage::deser(&buf).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_kind(b"\x06\0\x01")]
    #[case::invalid_bool(b"\x01\0\0\0\0\0\0\0\x01\0\x01\x05\0\0")]
    #[case::truncated_ack(b"\x02\0\0\0\0\0\0\0\x01\0")]
    fn test_deser_invalid(#[case] buf: &[u8]) {
        assert!(UnicastMessage::deser(buf).is_err());
    }
}
