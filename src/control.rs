//! Control-plane codec and framed stream.
//!
//! Control messages are fixed-size records carried over the reliable TCP
//! side-channel. Every record begins with the protocol magic so a corrupted
//! stream can be re-synchronized by scanning. All integer fields travel in
//! network byte order.
//!
//! SR acknowledgments reuse scalar fields of the shared parameter block
//! instead of growing the record; the overloading is part of the wire
//! contract and is exposed here through named accessors:
//!
//! | logical field      | carried in             |
//! |--------------------|------------------------|
//! | `cumulative_chunk` | `params.max_inflight`   |
//! | primary gap start  | `params.rto_ms`         |
//! | primary gap length | `params.rtt_alpha_ms`   |
//! | `total_chunks`     | `params.total_chunks`   |

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::time::Duration;

use tracing::warn;

use crate::MAGIC;

/// Number of 64-bit words in the chunk-bitmap field.
pub const BITMAP_WORDS: usize = 16;

/// Number of gap slots in a control frame.
pub const GAP_SLOTS: usize = 16;

/// Serialized size of [`WireParams`].
pub const PARAMS_LEN: usize = 68;

/// Serialized size of a [`ControlFrame`].
pub const FRAME_LEN: usize = 8 + PARAMS_LEN + 2 + BITMAP_WORDS * 8 + 2 + GAP_SLOTS * 8;

/// Control message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Sender proposes transfer parameters.
    Offer = 0,
    /// Receiver finalizes parameters and assigns the generation.
    Cts = 1,
    /// Sender confirms and begins data.
    Accept = 2,
    /// Receiver refuses the offer.
    Reject = 3,
    /// Transfer complete.
    CompleteAck = 4,
    /// Transfer failed (timeout / unrecoverable loss).
    IncompleteNack = 5,
    /// Selective-repeat cumulative ACK with bitmap window.
    SrAck = 6,
    /// Selective-repeat gap hints.
    SrNack = 7,
    /// Erasure-coding decode success.
    EcAck = 8,
    /// Erasure-coding retransmit request.
    EcNack = 9,
    /// Switch this transfer from EC to SR.
    EcFallbackSr = 10,
}

impl ControlType {
    /// Parse control type from its wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Offer),
            1 => Some(Self::Cts),
            2 => Some(Self::Accept),
            3 => Some(Self::Reject),
            4 => Some(Self::CompleteAck),
            5 => Some(Self::IncompleteNack),
            6 => Some(Self::SrAck),
            7 => Some(Self::SrNack),
            8 => Some(Self::EcAck),
            9 => Some(Self::EcNack),
            10 => Some(Self::EcFallbackSr),
            _ => None,
        }
    }
}

/// Transfer parameters negotiated during the handshake and frozen for the
/// lifetime of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireParams {
    /// Generation number stamped on every datagram of the transfer.
    pub transfer_id: u32,
    /// Total message size in bytes (data + parity for EC transfers).
    pub total_bytes: u64,
    /// Payload bytes per packet.
    pub mtu_bytes: u32,
    /// Reserved; echoes `mtu_bytes`.
    pub packet_bytes: u32,
    /// Bytes per chunk (`mtu_bytes * packets_per_chunk`).
    pub chunk_bytes: u32,
    /// Packets grouped per chunk.
    pub packets_per_chunk: u16,
    /// Total chunk count (overloaded by SR acknowledgments).
    pub total_chunks: u32,
    /// Erasure-coding data shards per stripe; zero for SR.
    pub fec_k: u16,
    /// Erasure-coding parity shards per stripe; zero for SR.
    pub fec_m: u16,
    /// Sender window hint (overloaded: SR cumulative chunk).
    pub max_inflight: u32,
    /// Retransmission timeout (overloaded: SR primary gap start).
    pub rto_ms: u32,
    /// RTT margin (overloaded: SR primary gap length).
    pub rtt_alpha_ms: u32,
    /// Number of UDP channels; ports are `channel_base_port + 0..n`.
    pub num_channels: u16,
    /// First UDP channel port.
    pub channel_base_port: u16,
    /// Receiver's datagram address, IPv4 text, NUL-padded.
    pub udp_server_ip: [u8; 16],
    /// Receiver's primary datagram port.
    pub udp_server_port: u16,
}

impl WireParams {
    /// Store an IPv4 address into the text field.
    pub fn set_server_ip(&mut self, ip: Ipv4Addr) {
        let text = ip.to_string();
        self.udp_server_ip = [0u8; 16];
        self.udp_server_ip[..text.len()].copy_from_slice(text.as_bytes());
    }

    /// Parse the receiver address out of the text field.
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        let end = self
            .udp_server_ip
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.udp_server_ip.len());
        std::str::from_utf8(&self.udp_server_ip[..end])
            .ok()?
            .parse()
            .ok()
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.transfer_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.total_bytes.to_be_bytes());
        buf[12..16].copy_from_slice(&self.mtu_bytes.to_be_bytes());
        buf[16..20].copy_from_slice(&self.packet_bytes.to_be_bytes());
        buf[20..24].copy_from_slice(&self.chunk_bytes.to_be_bytes());
        buf[24..26].copy_from_slice(&self.packets_per_chunk.to_be_bytes());
        buf[26..30].copy_from_slice(&self.total_chunks.to_be_bytes());
        buf[30..32].copy_from_slice(&self.fec_k.to_be_bytes());
        buf[32..34].copy_from_slice(&self.fec_m.to_be_bytes());
        buf[34..38].copy_from_slice(&self.max_inflight.to_be_bytes());
        buf[38..42].copy_from_slice(&self.rto_ms.to_be_bytes());
        buf[42..46].copy_from_slice(&self.rtt_alpha_ms.to_be_bytes());
        buf[46..48].copy_from_slice(&self.num_channels.to_be_bytes());
        buf[48..50].copy_from_slice(&self.channel_base_port.to_be_bytes());
        buf[50..66].copy_from_slice(&self.udp_server_ip);
        buf[66..68].copy_from_slice(&self.udp_server_port.to_be_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&buf[50..66]);
        Self {
            transfer_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            total_bytes: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            mtu_bytes: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            packet_bytes: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            chunk_bytes: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            packets_per_chunk: u16::from_be_bytes(buf[24..26].try_into().unwrap()),
            total_chunks: u32::from_be_bytes(buf[26..30].try_into().unwrap()),
            fec_k: u16::from_be_bytes(buf[30..32].try_into().unwrap()),
            fec_m: u16::from_be_bytes(buf[32..34].try_into().unwrap()),
            max_inflight: u32::from_be_bytes(buf[34..38].try_into().unwrap()),
            rto_ms: u32::from_be_bytes(buf[38..42].try_into().unwrap()),
            rtt_alpha_ms: u32::from_be_bytes(buf[42..46].try_into().unwrap()),
            num_channels: u16::from_be_bytes(buf[46..48].try_into().unwrap()),
            channel_base_port: u16::from_be_bytes(buf[48..50].try_into().unwrap()),
            udp_server_ip: ip,
            udp_server_port: u16::from_be_bytes(buf[66..68].try_into().unwrap()),
        }
    }
}

/// Fixed-size control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Message discriminator.
    pub control_type: ControlType,
    /// Connection identifier.
    pub connection_id: u32,
    /// Parameter block (overloaded by SR acknowledgments).
    pub params: WireParams,
    /// Number of meaningful words in `chunk_bitmap`.
    pub bitmap_words: u16,
    /// Chunk-completion bitmap snapshot.
    pub chunk_bitmap: [u64; BITMAP_WORDS],
    /// Number of meaningful entries in the gap arrays.
    pub num_gaps: u16,
    /// First chunk index of each reported gap.
    pub gap_start: [u32; GAP_SLOTS],
    /// Length in chunks of each reported gap.
    pub gap_len: [u32; GAP_SLOTS],
}

impl ControlFrame {
    /// Create a frame of the given type with zeroed parameters.
    pub fn new(control_type: ControlType, connection_id: u32) -> Self {
        Self {
            control_type,
            connection_id,
            params: WireParams::default(),
            bitmap_words: 0,
            chunk_bitmap: [0; BITMAP_WORDS],
            num_gaps: 0,
            gap_start: [0; GAP_SLOTS],
            gap_len: [0; GAP_SLOTS],
        }
    }

    /// Highest chunk index `c` such that chunks `0..=c` are all complete,
    /// or `None` when no leading run exists. Carried in the overloaded
    /// `max_inflight` field as `index + 1` so that zero means "nothing".
    pub fn cumulative_chunk(&self) -> Option<u32> {
        self.params.max_inflight.checked_sub(1)
    }

    /// Store the cumulative chunk index (see [`Self::cumulative_chunk`]).
    pub fn set_cumulative_chunk(&mut self, cumulative: Option<u32>) {
        self.params.max_inflight = match cumulative {
            Some(c) => c + 1,
            None => 0,
        };
    }

    /// Primary gap `(start, len)`, carried in the overloaded `rto_ms` /
    /// `rtt_alpha_ms` fields.
    pub fn primary_gap(&self) -> (u32, u32) {
        (self.params.rto_ms, self.params.rtt_alpha_ms)
    }

    /// Store the primary gap (see [`Self::primary_gap`]).
    pub fn set_primary_gap(&mut self, start: u32, len: u32) {
        self.params.rto_ms = start;
        self.params.rtt_alpha_ms = len;
    }

    /// Reported gaps as `(start, len)` pairs.
    pub fn gaps(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let count = usize::from(self.num_gaps).min(GAP_SLOTS);
        (0..count).map(move |i| (self.gap_start[i], self.gap_len[i]))
    }

    /// Append a gap if a slot remains; silently drops overflow.
    pub fn push_gap(&mut self, start: u32, len: u32) {
        let i = usize::from(self.num_gaps);
        if i < GAP_SLOTS {
            self.gap_start[i] = start;
            self.gap_len[i] = len;
            self.num_gaps += 1;
        }
    }

    /// Serialize into a fixed-size wire record.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2] = self.control_type as u8;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.connection_id.to_be_bytes());
        self.params.encode_into(&mut buf[8..8 + PARAMS_LEN]);
        let mut at = 8 + PARAMS_LEN;
        buf[at..at + 2].copy_from_slice(&self.bitmap_words.to_be_bytes());
        at += 2;
        for word in &self.chunk_bitmap {
            buf[at..at + 8].copy_from_slice(&word.to_be_bytes());
            at += 8;
        }
        buf[at..at + 2].copy_from_slice(&self.num_gaps.to_be_bytes());
        at += 2;
        for start in &self.gap_start {
            buf[at..at + 4].copy_from_slice(&start.to_be_bytes());
            at += 4;
        }
        for len in &self.gap_len {
            buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
            at += 4;
        }
        buf
    }

    /// Deserialize a wire record.
    ///
    /// Returns `None` for a magic mismatch or unknown control type; the
    /// stream layer then resynchronizes by scanning for the next magic.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_LEN {
            return None;
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != MAGIC {
            return None;
        }
        let control_type = ControlType::from_u8(buf[2])?;
        let connection_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let params = WireParams::decode_from(&buf[8..8 + PARAMS_LEN]);
        let mut at = 8 + PARAMS_LEN;
        let bitmap_words = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap());
        at += 2;
        let mut chunk_bitmap = [0u64; BITMAP_WORDS];
        for word in &mut chunk_bitmap {
            *word = u64::from_be_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
        }
        let num_gaps = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap());
        at += 2;
        let mut gap_start = [0u32; GAP_SLOTS];
        for start in &mut gap_start {
            *start = u32::from_be_bytes(buf[at..at + 4].try_into().unwrap());
            at += 4;
        }
        let mut gap_len = [0u32; GAP_SLOTS];
        for len in &mut gap_len {
            *len = u32::from_be_bytes(buf[at..at + 4].try_into().unwrap());
            at += 4;
        }
        Some(Self {
            control_type,
            connection_id,
            params,
            bitmap_words,
            chunk_bitmap,
            num_gaps,
            gap_start,
            gap_len,
        })
    }
}

/// Framed control stream over TCP.
///
/// Reads block until a full record has accumulated; a read timeout set via
/// [`ControlStream::recv_timeout`] leaves any partial record buffered so the
/// next call resumes where the last one stopped.
#[derive(Debug)]
pub struct ControlStream {
    stream: TcpStream,
    partial: Vec<u8>,
}

impl ControlStream {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            partial: Vec::with_capacity(FRAME_LEN),
        }
    }

    /// Send one control record.
    pub fn send(&mut self, frame: &ControlFrame) -> io::Result<()> {
        self.stream.write_all(&frame.encode())
    }

    /// Receive one control record, blocking until it is complete.
    pub fn recv(&mut self) -> io::Result<ControlFrame> {
        self.stream.set_read_timeout(None)?;
        loop {
            self.fill_to_frame()?;
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
        }
    }

    /// Receive one control record, or `None` if `timeout` elapses first.
    pub fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<ControlFrame>> {
        // A zero timeout would mean "block forever" to the socket layer.
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        loop {
            match self.fill_to_frame() {
                Ok(()) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
        }
    }

    /// Read until the partial buffer holds a full record.
    fn fill_to_frame(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; FRAME_LEN];
        while self.partial.len() < FRAME_LEN {
            let want = FRAME_LEN - self.partial.len();
            let n = self.stream.read(&mut chunk[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control stream closed",
                ));
            }
            self.partial.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Try to decode the buffered record, resynchronizing on garbage.
    fn take_frame(&mut self) -> Option<ControlFrame> {
        if let Some(frame) = ControlFrame::decode(&self.partial) {
            self.partial.clear();
            return Some(frame);
        }
        // Scan past the corrupt prefix to the next magic candidate.
        let magic = MAGIC.to_be_bytes();
        let resync = self.partial[1..]
            .windows(2)
            .position(|w| w == &magic)
            .map(|p| p + 1)
            .unwrap_or(self.partial.len());
        warn!(skipped = resync, "corrupt control record, resynchronizing");
        self.partial.drain(..resync);
        None
    }
}
