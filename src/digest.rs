use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::messaging::node_addr::NodeAddr;
use crate::seqno::Seqno;
use crate::table::Watermarks;

/// An immutable snapshot of the watermarks of every sender's table. Digests are used to bring a
///  joining member's tables in line with the rest of the group, and they are what members vote
///  with in stability rounds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Digest(Arc<BTreeMap<NodeAddr, Watermarks>>);

impl Digest {
    pub fn new(entries: BTreeMap<NodeAddr, Watermarks>) -> Digest {
        Digest(Arc::new(entries))
    }

    pub fn get(&self, sender: &NodeAddr) -> Option<Watermarks> {
        self.0.get(sender).copied()
    }

    pub fn contains(&self, sender: &NodeAddr) -> bool {
        self.0.contains_key(sender)
    }

    pub fn iter(&self) -> impl Iterator<Item=(&NodeAddr, &Watermarks)> {
        self.0.iter()
    }

    pub fn senders(&self) -> impl Iterator<Item=&NodeAddr> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.0.len());
        for (sender, wm) in self.0.iter() {
            sender.ser(buf);
            buf.put_u64_varint(wm.low.to_raw());
            buf.put_u64_varint(wm.highest_delivered.to_raw());
            buf.put_u64_varint(wm.highest_received.to_raw());
        }
    }

    /// Entries that are not internally consistent (`low <= hd <= hr`) cause the whole digest to
    ///  be rejected.
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Digest> {
        let num_entries = buf.try_get_usize_varint()?;
        if num_entries > buf.remaining() {
            bail!("invalid number of digest entries: {}", num_entries);
        }

        let mut entries = BTreeMap::new();
        for _ in 0..num_entries {
            let sender = NodeAddr::try_deser(buf)?;
            let wm = Watermarks::new(
                Seqno::from_raw(buf.try_get_u64_varint()?),
                Seqno::from_raw(buf.try_get_u64_varint()?),
                Seqno::from_raw(buf.try_get_u64_varint()?),
            );
            if !wm.is_consistent() {
                bail!("inconsistent digest entry for {:?}: {:?}", sender, wm);
            }
            if entries.insert(sender, wm).is_some() {
                bail!("duplicate digest entry for {:?}", sender);
            }
        }
        Ok(Digest::new(entries))
    }
}

impl FromIterator<(NodeAddr, Watermarks)> for Digest {
    fn from_iter<I: IntoIterator<Item=(NodeAddr, Watermarks)>>(iter: I) -> Self {
        Digest::new(iter.into_iter().collect())
    }
}
