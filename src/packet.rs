//! MMDVM wire codec.
//!
//! Frames are recognised by a leading ASCII tag together with an exact
//! datagram size; all multibyte integers are big-endian. The voice payload
//! is the 55-byte `DMRD` frame:
//!
//! ```text
//! ┌───────┬─────────┬───────┬─────────┬────────┬─────────┬─────────┐
//! │ DMRD  │ seq (1) │ radio │ dst (3) │ node   │ flags   │ stream  │
//! │ (4 B) │         │ (3 B) │         │ (4 B)  │ (1 B)   │ (4 B)   │ ...
//! └───────┴─────────┴───────┴─────────┴────────┴─────────┴─────────┘
//!   offset 0    4       5        8        11       15        16
//! ```
//!
//! Flags byte: bit 7 selects slot 2, bit 6 marks a private call, and the
//! low bits encode the frame type — `(flags & 0x23) == 0x21` starts a
//! stream, `(flags & 0x23) == 0x22` ends one.

use crate::ident;

/// Exact size of a DMRD voice frame.
pub const DMRD_LEN: usize = 55;

/// Offset of the transmitting radio's DMR ID.
pub const RADIO_OFFSET: usize = 5;
/// Offset of the destination talkgroup or private-call peer.
pub const DST_OFFSET: usize = 8;
/// Offset of the originating hotspot's node ID.
pub const NODE_OFFSET: usize = 11;
/// Offset of the flags byte.
pub const FLAGS_OFFSET: usize = 15;
/// Offset of the stream ID.
pub const STREAM_OFFSET: usize = 16;

const FLAG_SLOT: u8 = 0x80;
const FLAG_PRIVATE: u8 = 0x40;
const STREAM_MASK: u8 = 0x23;
const STREAM_START: u8 = 0x21;
const STREAM_END: u8 = 0x22;

/// Reads a big-endian u16 at `off`.
pub fn get_u16(pk: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([pk[off], pk[off + 1]])
}

/// Reads a big-endian 24-bit integer at `off`.
pub fn get_u24(pk: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([0, pk[off], pk[off + 1], pk[off + 2]])
}

/// Reads a big-endian u32 at `off`.
pub fn get_u32(pk: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([pk[off], pk[off + 1], pk[off + 2], pk[off + 3]])
}

/// Writes a big-endian 24-bit integer at `off`.
pub fn put_u24(pk: &mut [u8], off: usize, n: u32) {
    pk[off] = (n >> 16) as u8;
    pk[off + 1] = (n >> 8) as u8;
    pk[off + 2] = n as u8;
}

/// Writes a big-endian u32 at `off`.
pub fn put_u32(pk: &mut [u8], off: usize, n: u32) {
    pk[off..off + 4].copy_from_slice(&n.to_be_bytes());
}

/// Parsed header of a DMRD voice frame.
#[derive(Debug, Clone, Copy)]
pub struct DmrdFrame {
    /// DMR ID of the transmitting handset.
    pub radioid: u32,
    /// Destination: talkgroup number, or peer DMR ID for private calls.
    pub dst: u32,
    /// Node ID of the originating hotspot.
    pub nodeid: u32,
    /// Stream identifier, constant for one transmission.
    pub streamid: u32,
    /// Raw flags byte.
    pub flags: u8,
}

impl DmrdFrame {
    /// Parses the header of a 55-byte DMRD frame.
    pub fn parse(pk: &[u8]) -> Option<Self> {
        if pk.len() != DMRD_LEN || &pk[..4] != b"DMRD" {
            return None;
        }
        Some(Self {
            radioid: get_u24(pk, RADIO_OFFSET),
            dst: get_u24(pk, DST_OFFSET),
            nodeid: get_u32(pk, NODE_OFFSET),
            streamid: get_u32(pk, STREAM_OFFSET),
            flags: pk[FLAGS_OFFSET],
        })
    }

    /// First frame of a transmission.
    pub fn is_stream_start(&self) -> bool {
        self.flags & STREAM_MASK == STREAM_START
    }

    /// Last frame of a transmission.
    pub fn is_stream_end(&self) -> bool {
        self.flags & STREAM_MASK == STREAM_END
    }

    /// Private (radio-to-radio) call rather than a talkgroup call.
    pub fn is_private(&self) -> bool {
        self.flags & FLAG_PRIVATE != 0
    }

    /// Slot index (0 or 1) the frame was transmitted on.
    pub fn slot_index(&self) -> usize {
        ((self.flags & FLAG_SLOT) != 0) as usize
    }

    /// Slot ID of the transmitting slot.
    pub fn slotid(&self) -> u32 {
        ident::slot_id(ident::node_of(self.nodeid), self.slot_index())
    }
}

/// Rewrites the slot bit of a DMRD frame to match the destination slot.
///
/// Relayed frames are otherwise verbatim; only bit 7 of the flags byte
/// changes so the receiving hotspot transmits on its own subscribed slot.
pub fn set_dest_slot(pk: &mut [u8], slot: usize) {
    if slot == 1 {
        pk[FLAGS_OFFSET] |= FLAG_SLOT;
    } else {
        pk[FLAGS_OFFSET] &= !FLAG_SLOT;
    }
}

/// A classified inbound datagram.
#[derive(Debug, Clone, Copy)]
pub enum Packet {
    /// `RPTL` login request.
    Login { nodeid: u32 },
    /// `RPTK` challenge response carrying the SHA-256 digest.
    Key { nodeid: u32, digest: [u8; 32] },
    /// `RPTC` node description (callsign, location and so on).
    Description { nodeid: u32 },
    /// `RPTPING` keepalive.
    Ping { nodeid: u32 },
    /// `RPTCL` logout.
    Close { nodeid: u32 },
    /// `DMRD` voice frame.
    Voice(DmrdFrame),
    /// `/STAT` local status query.
    Status,
}

/// Classifies a datagram by `(size, tag)`.
///
/// Returns `None` for anything that does not match a known frame layout;
/// such datagrams are dropped by the dispatcher.
pub fn classify(pk: &[u8]) -> Option<Packet> {
    if pk.len() == DMRD_LEN && pk.starts_with(b"DMRD") {
        return DmrdFrame::parse(pk).map(Packet::Voice);
    }
    if pk.len() == 8 && pk.starts_with(b"RPTL") {
        return Some(Packet::Login { nodeid: get_u32(pk, 4) });
    }
    if pk.len() == 40 && pk.starts_with(b"RPTK") {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&pk[8..40]);
        return Some(Packet::Key { nodeid: get_u32(pk, 4), digest });
    }
    if pk.len() == 302 && pk.starts_with(b"RPTC") {
        return Some(Packet::Description { nodeid: get_u32(pk, 4) });
    }
    if pk.len() == 11 && pk.starts_with(b"RPTPING") {
        return Some(Packet::Ping { nodeid: get_u32(pk, 7) });
    }
    if pk.len() == 9 && pk.starts_with(b"RPTCL") {
        return Some(Packet::Close { nodeid: get_u32(pk, 5) });
    }
    if pk.len() >= 5 && pk.starts_with(b"/STAT") {
        return Some(Packet::Status);
    }
    None
}

/// `RPTACK` carrying the login salt, sent in reply to `RPTL`.
pub fn login_ack(salt: [u8; 4]) -> [u8; 10] {
    let mut pk = [0u8; 10];
    pk[..6].copy_from_slice(b"RPTACK");
    pk[6..].copy_from_slice(&salt);
    pk
}

/// `RPTACK` carrying the node ID, sent in reply to `RPTK` and `RPTC`.
pub fn ack(nodeid: u32) -> [u8; 10] {
    let mut pk = [0u8; 10];
    pk[..6].copy_from_slice(b"RPTACK");
    put_u32(&mut pk, 6, nodeid);
    pk
}

/// `MSTNAK` rejection.
pub fn nak(nodeid: u32) -> [u8; 10] {
    let mut pk = [0u8; 10];
    pk[..6].copy_from_slice(b"MSTNAK");
    put_u32(&mut pk, 6, nodeid);
    pk
}

/// `MSTPONG` keepalive reply.
pub fn pong(nodeid: u32) -> [u8; 11] {
    let mut pk = [0u8; 11];
    pk[..7].copy_from_slice(b"MSTPONG");
    put_u32(&mut pk, 7, nodeid);
    pk
}

/// Hex rendering of a packet for debug traces.
pub fn hex_dump(pk: &[u8]) -> String {
    pk.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
