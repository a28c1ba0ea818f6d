use std::fmt::{Debug, Display, Formatter};

/// Per-sender message index. Sequence numbers start at 1 and are never reused; `0` means
///  "nothing yet" and is used as the initial value of all watermarks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Seqno(u64);

impl Display for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);
    pub const FIRST: Seqno = Seqno(1);
    pub const MAX: Seqno = Seqno(u64::MAX);

    pub const fn from_raw(value: u64) -> Seqno {
        Seqno(value)
    }

    pub const fn to_raw(&self) -> u64 {
        self.0
    }

    /// `None` on wraparound, which the send path treats as a fatal condition
    pub fn next(&self) -> Option<Seqno> {
        self.0.checked_add(1).map(Seqno)
    }

    /// saturating at zero
    pub fn prev(&self) -> Seqno {
        Seqno(self.0.saturating_sub(1))
    }

    pub fn saturating_add(&self, n: u64) -> Seqno {
        Seqno(self.0.saturating_add(n))
    }

    /// number of sequence numbers in `(other, self]`, or 0 if `other >= self`
    pub fn distance_from(&self, other: Seqno) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Self {
        Seqno(value)
    }
}
