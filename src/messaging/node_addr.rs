use std::fmt::{Debug, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// Address of a group member: its network address plus a 'unique' part that distinguishes
///  incarnations of a process at the same network address.
///
/// Sequence numbers are per incarnation: a restarted process starts again at seqno 1, and the
///  unique part ensures that it is not confused with its previous incarnation. The unique part is
///  initialized with the seconds since epoch, which is good enough for that purpose - it is not a
///  security feature.
///
/// Addresses are totally ordered, and the lowest member of a view drives stability rounds.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr {
    pub unique: u32,
    pub socket_addr: SocketAddr,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.socket_addr, self.unique)
    }
}

const DISCRIMINATOR_V4: u8 = 4;
const DISCRIMINATOR_V6: u8 = 6;

impl NodeAddr {
    pub fn new(unique: u32, socket_addr: SocketAddr) -> NodeAddr {
        NodeAddr {
            unique,
            socket_addr,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.unique);
        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(DISCRIMINATOR_V4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(DISCRIMINATOR_V6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let unique = buf.try_get_u32()?;

        let socket_addr = match buf.try_get_u8()? {
            DISCRIMINATOR_V4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            DISCRIMINATOR_V6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => bail!("invalid socket address discriminator: {}", n),
        };
        Ok(NodeAddr {
            unique,
            socket_addr,
        })
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        NodeAddr {
            unique,
            socket_addr,
        }
    }
}
