use tracing::trace;

use crate::{
    constants::{SWP_HEADER, SWP_VERSION},
    error::{Error, Result},
    seq_nr::Seqno,
};

pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_DATA: u8 = 0x2;
const KNOWN_FLAGS: u8 = FLAG_ACK | FLAG_DATA;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    // Sequence number of the payload. Meaningless for pure ACKs.
    pub seq_nr: Seqno,
    // The DATA packet this ACK acknowledges.
    pub ack_nr: Seqno,
    // Every seq_nr below this one was delivered by the receiver.
    pub cumulative_ack: Seqno,
    // How many more packets the receiver can buffer.
    pub wnd: u32,
}

impl PacketHeader {
    pub fn data(seq_nr: Seqno) -> Self {
        Self {
            flags: FLAG_DATA,
            seq_nr,
            ..Default::default()
        }
    }

    pub fn ack(ack_nr: Seqno, cumulative_ack: Seqno, wnd: u32) -> Self {
        Self {
            flags: FLAG_ACK,
            ack_nr,
            cumulative_ack,
            wnd,
            ..Default::default()
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & FLAG_DATA != 0
    }

    pub fn short_repr(&self) -> impl std::fmt::Display + '_ {
        struct D<'a>(&'a PacketHeader);
        impl std::fmt::Display for D<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let h = self.0;
                match (h.is_data(), h.is_ack()) {
                    (true, true) => write!(f, "DATA+ACK:seq_nr={}:ack_nr={}", h.seq_nr, h.ack_nr)?,
                    (true, false) => write!(f, "DATA:seq_nr={}", h.seq_nr)?,
                    (false, true) => write!(f, "ACK:ack_nr={}", h.ack_nr)?,
                    (false, false) => write!(f, "EMPTY")?,
                }
                if h.is_ack() {
                    write!(f, ":cum={}:wnd={}", h.cumulative_ack, h.wnd)?;
                }
                Ok(())
            }
        }
        D(self)
    }

    pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize> {
        if buffer.len() < SWP_HEADER {
            return Err(Error::Text("too small buffer for header"));
        }
        buffer[0] = (SWP_VERSION << 4) | (self.flags & 0x0f);
        buffer[1..9].copy_from_slice(&self.seq_nr.0.to_be_bytes());
        buffer[9..17].copy_from_slice(&self.ack_nr.0.to_be_bytes());
        buffer[17..25].copy_from_slice(&self.cumulative_ack.0.to_be_bytes());
        buffer[25..29].copy_from_slice(&self.wnd.to_be_bytes());
        Ok(SWP_HEADER)
    }

    pub fn deserialize(buffer: &[u8]) -> Option<(Self, usize)> {
        let buffer = buffer.get(..SWP_HEADER)?;

        let version = buffer[0] >> 4;
        if version != SWP_VERSION {
            trace!(version, "wrong version");
            return None;
        }
        let flags = buffer[0] & 0x0f;
        if flags & !KNOWN_FLAGS != 0 || flags == 0 {
            trace!(flags, "unknown flags");
            return None;
        }

        let u64_at = |pos: usize| -> Option<u64> {
            Some(u64::from_be_bytes(buffer.get(pos..pos + 8)?.try_into().ok()?))
        };

        let header = PacketHeader {
            flags,
            seq_nr: Seqno(u64_at(1)?),
            ack_nr: Seqno(u64_at(9)?),
            cumulative_ack: Seqno(u64_at(17)?),
            wnd: u32::from_be_bytes(buffer.get(25..29)?.try_into().ok()?),
        };
        Some((header, SWP_HEADER))
    }
}
