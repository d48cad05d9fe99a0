use tracing::trace;

use crate::{
    Payload,
    constants::{MAX_INBOX_LEN, SWP_HEADER},
    error::{Error, Result},
    raw::PacketHeader,
    seq_nr::Seqno,
};

/// A unit of transmission. Retransmissions resend the same `Packet`.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    /// Inbox of the sender. ACKs are addressed here.
    pub from: String,
    /// Inbox the packet is addressed to.
    pub dest: String,
    pub data: Payload,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:payload_len={}",
            self.header.short_repr(),
            self.from,
            self.dest,
            self.payload().len()
        )
    }
}

impl Packet {
    pub fn new_data(seq_nr: Seqno, from: &str, dest: &str, data: Payload) -> Self {
        Self {
            header: PacketHeader::data(seq_nr),
            from: from.to_owned(),
            dest: dest.to_owned(),
            data,
        }
    }

    pub fn new_ack(ack_nr: Seqno, cumulative_ack: Seqno, wnd: u32, from: &str, dest: &str) -> Self {
        Self {
            header: PacketHeader::ack(ack_nr, cumulative_ack, wnd),
            from: from.to_owned(),
            dest: dest.to_owned(),
            data: Default::default(),
        }
    }

    pub fn seq_nr(&self) -> Seqno {
        self.header.seq_nr
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; SWP_HEADER];
        self.header.serialize(&mut buf)?;
        for inbox in [&self.from, &self.dest] {
            if inbox.len() > MAX_INBOX_LEN {
                return Err(Error::Text("inbox name too long"));
            }
            buf.push(inbox.len() as u8);
            buf.extend_from_slice(inbox.as_bytes());
        }
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        let (header, hsize) = PacketHeader::deserialize(buf)?;
        let mut rest = &buf[hsize..];

        let from = read_inbox(&mut rest)?;
        let dest = read_inbox(&mut rest)?;

        if !header.is_data() && !rest.is_empty() {
            trace!(header=%header.short_repr(), "ACK packet with payload, ignoring");
            return None;
        }

        Some(Self {
            header,
            from,
            dest,
            data: rest.to_owned(),
        })
    }
}

fn read_inbox(buf: &mut &[u8]) -> Option<String> {
    let cur: &[u8] = *buf;
    let len = *cur.first()? as usize;
    let name = std::str::from_utf8(cur.get(1..1 + len)?).ok()?.to_owned();
    *buf = &cur[1 + len..];
    Some(name)
}
