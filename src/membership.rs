use std::collections::BTreeSet;

use crate::messaging::node_addr::NodeAddr;

/// A view is the membership of the group as agreed by the (external) membership protocol. View
///  ids increase with every view change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct View {
    pub id: u64,
    members: BTreeSet<NodeAddr>,
}

impl View {
    pub fn new(id: u64, members: impl IntoIterator<Item=NodeAddr>) -> View {
        View {
            id,
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item=&NodeAddr> {
        self.members.iter()
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The member that runs stability rounds, which is the lowest member
    pub fn stability_driver(&self) -> Option<NodeAddr> {
        self.members.first().copied()
    }

    /// members of this view that were not part of `previous`
    pub fn joined_since(&self, previous: &View) -> Vec<NodeAddr> {
        self.members.difference(&previous.members).copied().collect()
    }

    /// members of `previous` that are no longer part of this view
    pub fn left_since(&self, previous: &View) -> Vec<NodeAddr> {
        previous.members.difference(&self.members).copied().collect()
    }
}
