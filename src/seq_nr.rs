use std::ops::Deref;

/// Packet sequence number. Assigned monotonically per session starting at 0,
/// never reused. 64 bits so it doesn't wrap within any realistic session.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub struct Seqno(pub u64);

impl Deref for Seqno {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::ops::Add<u64> for Seqno {
    type Output = Seqno;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u64> for Seqno {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<Seqno> for Seqno {
    type Output = u64;

    fn sub(self, rhs: Seqno) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}
