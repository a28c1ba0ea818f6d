use std::net::{Ipv4Addr, SocketAddrV4};

use crate::membership::View;
use crate::messaging::node_addr::NodeAddr;

/// convenience method for unit test code: create a [NodeAddr] based on a number, the same number
///  generating the same address and different numbers different addresses. Lower numbers give
///  lower addresses.
pub fn test_node_addr_from_number(number: u16) -> NodeAddr {
    NodeAddr {
        unique: number.into(),
        socket_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into(),
    }
}

pub fn test_view(id: u64, members: &[u16]) -> View {
    View::new(id, members.iter().map(|&n| test_node_addr_from_number(n)))
}
