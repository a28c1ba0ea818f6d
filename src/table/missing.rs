use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::seqno::Seqno;

/// A sorted list of disjoint, non-adjacent inclusive seqno ranges. This is the gap descriptor
///  that is derived from a table on every retransmission tick, and it is also the payload of
///  XMIT_REQ messages.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SeqnoRanges {
    ranges: Vec<(Seqno, Seqno)>,
}

impl Debug for SeqnoRanges {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, (from, to)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if from == to {
                write!(f, "{}", from)?;
            }
            else {
                write!(f, "{}-{}", from, to)?;
            }
        }
        write!(f, "]")
    }
}

impl SeqnoRanges {
    pub fn new() -> SeqnoRanges {
        Default::default()
    }

    pub fn from_range(from: Seqno, to: Seqno) -> SeqnoRanges {
        let mut result = SeqnoRanges::new();
        result.push_range(from, to);
        result
    }

    /// Appends a seqno. Seqnos must be pushed in ascending order; a seqno at or below the current
    ///  highest one is ignored.
    pub fn push(&mut self, seqno: Seqno) {
        self.push_range(seqno, seqno)
    }

    pub fn push_range(&mut self, from: Seqno, to: Seqno) {
        if from > to || from == Seqno::ZERO {
            return;
        }

        if let Some((_, last_to)) = self.ranges.last_mut() {
            if from <= *last_to {
                return;
            }
            if from.prev() == *last_to {
                *last_to = to;
                return;
            }
        }
        self.ranges.push((from, to));
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(Seqno, Seqno)] {
        &self.ranges
    }

    /// total number of seqnos in all ranges
    pub fn num_seqnos(&self) -> u64 {
        self.ranges.iter()
            .map(|(from, to)| to.distance_from(*from) + 1)
            .sum()
    }

    pub fn first(&self) -> Option<Seqno> {
        self.ranges.first().map(|(from, _)| *from)
    }

    pub fn last(&self) -> Option<Seqno> {
        self.ranges.last().map(|(_, to)| *to)
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        self.ranges.iter()
            .any(|(from, to)| *from <= seqno && seqno <= *to)
    }

    pub fn iter(&self) -> impl Iterator<Item=Seqno> + '_ {
        self.ranges.iter()
            .flat_map(|(from, to)| (from.to_raw()..=to.to_raw()).map(Seqno::from_raw))
    }

    /// removes all seqnos above `seqno`
    pub fn remove_higher_than(&mut self, seqno: Seqno) {
        self.ranges.retain(|(from, _)| *from <= seqno);
        if let Some((_, to)) = self.ranges.last_mut() {
            if *to > seqno {
                *to = seqno;
            }
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.ranges.len());
        for (from, to) in &self.ranges {
            buf.put_u64(from.to_raw());
            buf.put_u64_varint(to.distance_from(*from));
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SeqnoRanges> {
        let num_ranges = buf.try_get_usize_varint()?;
        if num_ranges > buf.remaining() {
            bail!("invalid number of seqno ranges: {}", num_ranges);
        }

        let mut ranges = Vec::with_capacity(num_ranges);
        let mut prev_to = Seqno::ZERO;
        for _ in 0..num_ranges {
            let from = Seqno::from_raw(buf.try_get_u64()?);
            let len = buf.try_get_u64_varint()?;
            let to = match from.to_raw().checked_add(len) {
                Some(to) => Seqno::from_raw(to),
                None => bail!("seqno range overflow: {} + {}", from, len),
            };
            if from <= prev_to {
                bail!("seqno ranges are not ascending: {} after {}", from, prev_to);
            }
            ranges.push((from, to));
            prev_to = to;
        }

        Ok(SeqnoRanges { ranges })
    }
}

impl FromIterator<Seqno> for SeqnoRanges {
    fn from_iter<I: IntoIterator<Item=Seqno>>(iter: I) -> Self {
        let mut result = SeqnoRanges::new();
        for seqno in iter {
            result.push(seqno);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn ranges(raw: &[u64]) -> SeqnoRanges {
        raw.iter().map(|&s| Seqno::from_raw(s)).collect()
    }

    #[rstest]
    #[case::empty(vec![], "[]")]
    #[case::single(vec![5], "[5]")]
    #[case::merged(vec![5, 6, 7], "[5-7]")]
    #[case::split(vec![5, 7], "[5,7]")]
    #[case::mixed(vec![1, 2, 4, 9, 10, 11], "[1-2,4,9-11]")]
    #[case::descending_ignored(vec![5, 3, 6], "[5-6]")]
    #[case::zero_ignored(vec![0, 1], "[1]")]
    fn test_push(#[case] seqnos: Vec<u64>, #[case] expected: &str) {
        assert_eq!(format!("{:?}", ranges(&seqnos)), expected);
    }

    #[rstest]
    #[case::all_below(vec![1, 2], 5, "[1-2]")]
    #[case::split_range(vec![1, 2, 3, 4], 2, "[1-2]")]
    #[case::drop_range(vec![1, 5, 6], 3, "[1]")]
    #[case::all_above(vec![7, 8], 3, "[]")]
    fn test_remove_higher_than(#[case] seqnos: Vec<u64>, #[case] seqno: u64, #[case] expected: &str) {
        let mut r = ranges(&seqnos);
        r.remove_higher_than(Seqno::from_raw(seqno));
        assert_eq!(format!("{:?}", r), expected);
    }

    #[test]
    fn test_num_seqnos_and_iter() {
        let r = ranges(&[3, 4, 5, 9]);
        assert_eq!(r.num_seqnos(), 4);
        assert_eq!(r.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![3, 4, 5, 9]);
        assert!(r.contains(Seqno::from_raw(4)));
        assert!(!r.contains(Seqno::from_raw(6)));
        assert_eq!(r.first(), Some(Seqno::from_raw(3)));
        assert_eq!(r.last(), Some(Seqno::from_raw(9)));
    }

    #[test]
    fn test_ser_deser() {
        let r = ranges(&[3, 4, 5, 9, 1000]);
        let mut buf = BytesMut::new();
        r.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(SeqnoRanges::try_deser(&mut b).unwrap(), r);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::truncated(b"\x01\0\0\0\0\0\0\0\x03")]
    #[case::too_many_ranges(b"\x7f\0")]
    #[case::not_ascending(b"\x02\0\0\0\0\0\0\0\x05\x00\0\0\0\0\0\0\0\x04\x00")]
    #[case::overflow(b"\x01\xff\xff\xff\xff\xff\xff\xff\xff\x02")]
    fn test_deser_invalid(#[case] mut buf: &[u8]) {
        assert!(SeqnoRanges::try_deser(&mut buf).is_err());
    }
}
