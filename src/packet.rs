//! Datagram packet codec.
//!
//! Every UDP datagram starts with a fixed 32-byte header followed by up to
//! [`MAX_PAYLOAD`] payload bytes. All multi-byte fields travel in network
//! byte order. `msg_id` (10 bits) and `packet_offset` (18 bits) share one
//! 32-bit word, packed explicitly with masks and shifts so the wire layout
//! does not depend on compiler bitfield behavior.
//!
//! # Wire Format
//!
//! ```text
//! ┌────────┬──────┬──────┬─────────────┬───────────────────────────┐
//! │ magic  │ type │ rsvd │ transfer_id │ msg_id:10 | offset:18 | 4 │
//! │ (2B)   │ (1B) │ (1B) │ (4B)        │ (4B)                      │
//! ├────────┴──────┴─────┬┴─────────────┼──────────┬────────────────┤
//! │ submsg_id (2B)      │ chunk_seq(4B)│ ppc (2B) │ fec_k (2B)     │
//! ├──────────┬──────────┼──────────────┼──────┬───┴────────────────┤
//! │ fec_m(2B)│ parity(2B│ payload_len  │flags │ reserved (3B)      │
//! └──────────┴──────────┴──────────────┴──────┴────────────────────┘
//! ```

use crate::{Error, Result, MAGIC};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 32;

/// Largest payload a single datagram may carry: a 1500-byte Ethernet MTU
/// minus the 8-byte UDP header minus our own header.
pub const MAX_PAYLOAD: usize = 1500 - 8 - HEADER_LEN;

const MSG_ID_BITS: u32 = 10;
const OFFSET_BITS: u32 = 18;
const MSG_ID_MASK: u32 = (1 << MSG_ID_BITS) - 1;
const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

/// Most packets a single message can address (18-bit packet offset).
pub const MAX_PACKETS: u32 = 1 << OFFSET_BITS;

/// Packet type discriminator for the datagram path.
///
/// Only `Data` and `Parity` appear on the wire in practice; the remaining
/// values are reserved by the protocol numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Application data.
    Data = 0,
    /// Erasure-coded parity.
    Parity = 1,
    /// Reserved (acknowledgments travel on the control stream).
    Ack = 2,
    /// Reserved.
    Nack = 3,
    /// Reserved (CTS travels on the control stream).
    Cts = 4,
}

impl PacketType {
    /// Parse packet type from its wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Parity),
            2 => Some(Self::Ack),
            3 => Some(Self::Nack),
            4 => Some(Self::Cts),
            _ => None,
        }
    }
}

/// Pack `msg_id` and `packet_offset` into their shared 32-bit word.
///
/// Low 10 bits carry the message id, the next 18 the packet offset, the top
/// 4 are reserved and transmitted as zero.
#[inline]
pub fn pack_ids(msg_id: u16, packet_offset: u32) -> u32 {
    debug_assert!(u32::from(msg_id) <= MSG_ID_MASK);
    debug_assert!(packet_offset <= OFFSET_MASK);
    (u32::from(msg_id) & MSG_ID_MASK) | ((packet_offset & OFFSET_MASK) << MSG_ID_BITS)
}

/// Inverse of [`pack_ids`].
#[inline]
pub fn unpack_ids(packed: u32) -> (u16, u32) {
    let msg_id = (packed & MSG_ID_MASK) as u16;
    let packet_offset = (packed >> MSG_ID_BITS) & OFFSET_MASK;
    (msg_id, packet_offset)
}

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Generation number; packets with a stale generation are discarded.
    pub transfer_id: u32,
    /// Message id within the 10-bit space.
    pub msg_id: u16,
    /// Global packet index within the message (18 bits).
    pub packet_offset: u32,
    /// Stripe index for erasure-coded transfers, zero otherwise.
    pub submsg_id: u16,
    /// Chunk index, derived from `packet_offset / packets_per_chunk`.
    pub chunk_seq: u32,
    /// Echo of the negotiated packets-per-chunk.
    pub packets_per_chunk: u16,
    /// Erasure-coding data shards per stripe; zero for pure-SR transfers.
    pub fec_k: u16,
    /// Erasure-coding parity shards per stripe; zero for pure-SR transfers.
    pub fec_m: u16,
    /// Parity index within the stripe, meaningful when `packet_type` is
    /// `Parity`.
    pub parity_idx: u16,
    /// Actual payload bytes carried (the trailing packet may be short).
    pub payload_len: u16,
    /// Optional flags.
    pub flags: u8,
}

impl PacketHeader {
    /// Build a DATA header. Fails when the payload exceeds [`MAX_PAYLOAD`].
    pub fn data(
        transfer_id: u32,
        msg_id: u16,
        packet_offset: u32,
        packets_per_chunk: u16,
        payload_len: usize,
    ) -> Result<Self> {
        if payload_len > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            packet_type: PacketType::Data,
            transfer_id,
            msg_id,
            packet_offset,
            submsg_id: 0,
            chunk_seq: chunk_of(packet_offset, packets_per_chunk),
            packets_per_chunk,
            fec_k: 0,
            fec_m: 0,
            parity_idx: 0,
            payload_len: payload_len as u16,
            flags: 0,
        })
    }

    /// Build a PARITY header carrying erasure-coding metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn parity(
        transfer_id: u32,
        msg_id: u16,
        packet_offset: u32,
        packets_per_chunk: u16,
        stripe: u16,
        fec_k: u16,
        fec_m: u16,
        parity_idx: u16,
        payload_len: usize,
    ) -> Result<Self> {
        let mut header = Self::data(
            transfer_id,
            msg_id,
            packet_offset,
            packets_per_chunk,
            payload_len,
        )?;
        header.packet_type = PacketType::Parity;
        header.submsg_id = stripe;
        header.fec_k = fec_k;
        header.fec_m = fec_m;
        header.parity_idx = parity_idx;
        Ok(header)
    }

    /// Chunk index this packet belongs to.
    pub fn chunk_id(&self) -> u32 {
        chunk_of(self.packet_offset, self.packets_per_chunk)
    }

    /// Serialize into the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_LEN`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2] = self.packet_type as u8;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.transfer_id.to_be_bytes());
        let packed = pack_ids(self.msg_id, self.packet_offset);
        buf[8..12].copy_from_slice(&packed.to_be_bytes());
        buf[12..14].copy_from_slice(&self.submsg_id.to_be_bytes());
        buf[14..18].copy_from_slice(&self.chunk_seq.to_be_bytes());
        buf[18..20].copy_from_slice(&self.packets_per_chunk.to_be_bytes());
        buf[20..22].copy_from_slice(&self.fec_k.to_be_bytes());
        buf[22..24].copy_from_slice(&self.fec_m.to_be_bytes());
        buf[24..26].copy_from_slice(&self.parity_idx.to_be_bytes());
        buf[26..28].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[28] = self.flags;
        buf[29..32].fill(0);
    }

    /// Deserialize a header from the start of a datagram.
    ///
    /// Returns `None` for short buffers, a magic mismatch, or an unknown
    /// packet type; the backend drops such datagrams and bumps a counter.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return None;
        }
        let packet_type = PacketType::from_u8(buf[2])?;
        let transfer_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let packed = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let (msg_id, packet_offset) = unpack_ids(packed);
        Some(Self {
            packet_type,
            transfer_id,
            msg_id,
            packet_offset,
            submsg_id: u16::from_be_bytes([buf[12], buf[13]]),
            chunk_seq: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            packets_per_chunk: u16::from_be_bytes([buf[18], buf[19]]),
            fec_k: u16::from_be_bytes([buf[20], buf[21]]),
            fec_m: u16::from_be_bytes([buf[22], buf[23]]),
            parity_idx: u16::from_be_bytes([buf[24], buf[25]]),
            payload_len: u16::from_be_bytes([buf[26], buf[27]]),
            flags: buf[28],
        })
    }
}

/// Encode a full datagram (`header || payload`) into a fresh buffer.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(payload.len(), usize::from(header.payload_len));
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];
    header.encode_into(&mut buf);
    buf[HEADER_LEN..].copy_from_slice(payload);
    buf
}

#[inline]
fn chunk_of(packet_offset: u32, packets_per_chunk: u16) -> u32 {
    if packets_per_chunk == 0 {
        return 0;
    }
    packet_offset / u32::from(packets_per_chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_ids() {
        for (msg_id, offset) in [(0u16, 0u32), (1023, 0), (0, OFFSET_MASK), (511, 131072)] {
            let packed = pack_ids(msg_id, offset);
            assert_eq!(unpack_ids(packed), (msg_id, offset));
        }
        // msg_id occupies the low bits
        assert_eq!(pack_ids(1023, 0), 0x3FF);
        assert_eq!(pack_ids(0, 1), 1 << 10);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::data(7, 42, 1000, 32, 900).unwrap();
        assert_eq!(header.chunk_seq, 1000 / 32);

        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        let parsed = PacketHeader::decode(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parity_roundtrip() {
        let header = PacketHeader::parity(3, 5, 4096, 64, 2, 4, 2, 1, MAX_PAYLOAD).unwrap();
        assert_eq!(header.packet_type, PacketType::Parity);
        assert_eq!(header.submsg_id, 2);

        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        let parsed = PacketHeader::decode(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let err = PacketHeader::data(1, 0, 0, 32, MAX_PAYLOAD + 1).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let header = PacketHeader::data(1, 0, 0, 32, 0).unwrap();
        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        buf[0] = 0xAA;
        assert!(PacketHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(PacketHeader::decode(&[0u8; HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let header = PacketHeader::data(1, 0, 0, 32, 0).unwrap();
        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        buf[2] = 99;
        assert!(PacketHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_encode_packet_frames_payload() {
        let payload = [0xABu8; 100];
        let header = PacketHeader::data(1, 2, 3, 32, payload.len()).unwrap();
        let wire = encode_packet(&header, &payload);
        assert_eq!(wire.len(), HEADER_LEN + 100);
        assert_eq!(&wire[HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn test_fields_travel_big_endian() {
        let header = PacketHeader::data(0x01020304, 1, 0, 32, 0).unwrap();
        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        assert_eq!(&buf[0..2], &[0x53, 0x44]);
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
    }
}
