//! Sender data plane.
//!
//! Builds DATA (and, for erasure-coded transfers, PARITY) packets from the
//! send buffer and fans them out across the negotiated UDP channels,
//! round-robin by packet index. Retransmission reuses the same path at chunk
//! granularity.
//!
//! The [`PacketSink`] seam exists so tests can interpose deterministic loss
//! without touching a real socket.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::control::WireParams;
use crate::packet::{PacketHeader, HEADER_LEN, MAX_PAYLOAD};
use crate::{Error, Result};

/// Destination for encoded datagrams, one logical channel per UDP port.
pub trait PacketSink: Send + Sync {
    /// Send one encoded datagram on the given channel.
    fn send(&self, datagram: &[u8], channel: u16) -> io::Result<()>;
}

/// Real UDP sink: channel `i` maps to `base_port + i` at the receiver.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    ip: Ipv4Addr,
    base_port: u16,
}

impl UdpSink {
    /// Bind an ephemeral local socket aimed at the receiver's channel run.
    pub fn new(ip: Ipv4Addr, base_port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            socket,
            ip,
            base_port,
        })
    }
}

impl PacketSink for UdpSink {
    fn send(&self, datagram: &[u8], channel: u16) -> io::Result<()> {
        self.socket
            .send_to(datagram, (self.ip, self.base_port + channel))?;
        Ok(())
    }
}

/// Deterministic-loss wrapper: drops every Nth datagram (counting from the
/// first). Test plumbing for loss-recovery scenarios.
#[derive(Debug)]
pub struct LossySink<S> {
    inner: S,
    counter: AtomicU64,
    drop_every_n: u64,
}

impl<S> LossySink<S> {
    /// Wrap a sink, dropping every `drop_every_n`th datagram (0 disables).
    pub fn with_pattern(inner: S, drop_every_n: u64) -> Self {
        Self {
            inner,
            counter: AtomicU64::new(0),
            drop_every_n,
        }
    }

    /// Datagrams offered so far, dropped or not.
    pub fn offered(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl<S: PacketSink> PacketSink for LossySink<S> {
    fn send(&self, datagram: &[u8], channel: u16) -> io::Result<()> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_every_n > 0 && count % self.drop_every_n == 0 {
            // Pretend it went out; the network ate it.
            return Ok(());
        }
        self.inner.send(datagram, channel)
    }
}

/// Erasure-coding layout the data plane needs to stamp PARITY headers.
#[derive(Debug, Clone, Copy)]
pub struct EcWire {
    /// Data shards per stripe.
    pub fec_k: u16,
    /// Parity shards per stripe.
    pub fec_m: u16,
    /// Chunks `0..data_chunks` carry data; the rest carry parity.
    pub data_chunks: u32,
}

/// Paced packet transmission over a [`PacketSink`].
#[derive(Debug)]
pub struct DataPlane<S> {
    sink: S,
    transfer_id: u32,
    msg_id: u16,
    mtu_bytes: u32,
    packets_per_chunk: u16,
    num_channels: u16,
    ec: Option<EcWire>,
    /// Fixed inter-packet delay for the paced burst; `None` sends at line
    /// rate.
    pace: Option<Duration>,
}

impl<S: PacketSink> DataPlane<S> {
    /// Create a data plane for one message under the negotiated parameters.
    pub fn new(sink: S, params: &WireParams, msg_id: u16, ec: Option<EcWire>) -> Self {
        Self {
            sink,
            transfer_id: params.transfer_id,
            msg_id,
            mtu_bytes: params.mtu_bytes,
            packets_per_chunk: params.packets_per_chunk,
            num_channels: params.num_channels.max(1),
            ec,
            pace: None,
        }
    }

    /// Set a fixed inter-packet delay.
    pub fn set_pace(&mut self, pace: Option<Duration>) {
        self.pace = pace;
    }

    /// Total packets needed for `data_len` bytes.
    pub fn total_packets(&self, data_len: usize) -> u32 {
        if self.mtu_bytes == 0 {
            return 0;
        }
        ((data_len as u64 + u64::from(self.mtu_bytes) - 1) / u64::from(self.mtu_bytes)) as u32
    }

    /// Borrow the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send every packet of the message once.
    pub fn send_all(&self, data: &[u8]) -> Result<u64> {
        let total = self.total_packets(data.len());
        let sent = self.send_range(data, 0, total)?;
        debug!(
            packets = sent,
            channels = self.num_channels,
            "initial burst complete"
        );
        Ok(sent)
    }

    /// Send packets `start..end`, round-robin across channels.
    pub fn send_range(&self, data: &[u8], start: u32, end: u32) -> Result<u64> {
        let mtu = self.mtu_bytes as usize;
        if mtu == 0 || mtu > MAX_PAYLOAD {
            return Err(Error::InvalidConfig("mtu out of range"));
        }
        let total = self.total_packets(data.len());
        let mut buf = vec![0u8; HEADER_LEN + mtu];
        let mut sent = 0u64;

        for index in start..end.min(total) {
            let offset = index as usize * mtu;
            let payload = &data[offset..data.len().min(offset + mtu)];
            let header = self.header_for(index, payload.len())?;
            header.encode_into(&mut buf[..HEADER_LEN]);
            buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);

            let channel = (index % u32::from(self.num_channels)) as u16;
            self.sink.send(&buf[..HEADER_LEN + payload.len()], channel)?;
            sent += 1;

            if let Some(pace) = self.pace {
                std::thread::sleep(pace);
            }
        }
        Ok(sent)
    }

    /// Retransmit whole chunks.
    pub fn send_chunks<I>(&self, data: &[u8], chunks: I) -> Result<u64>
    where
        I: IntoIterator<Item = u32>,
    {
        let ppc = u32::from(self.packets_per_chunk.max(1));
        let mut sent = 0u64;
        for chunk in chunks {
            sent += self.send_range(data, chunk * ppc, (chunk + 1) * ppc)?;
        }
        Ok(sent)
    }

    fn header_for(&self, index: u32, payload_len: usize) -> Result<PacketHeader> {
        if let Some(ec) = self.ec {
            let chunk = if self.packets_per_chunk == 0 {
                0
            } else {
                index / u32::from(self.packets_per_chunk)
            };
            if chunk >= ec.data_chunks {
                let parity_chunk = chunk - ec.data_chunks;
                let stripe = (parity_chunk / u32::from(ec.fec_m.max(1))) as u16;
                let parity_idx = (parity_chunk % u32::from(ec.fec_m.max(1))) as u16;
                return PacketHeader::parity(
                    self.transfer_id,
                    self.msg_id,
                    index,
                    self.packets_per_chunk,
                    stripe,
                    ec.fec_k,
                    ec.fec_m,
                    parity_idx,
                    payload_len,
                );
            }
        }
        PacketHeader::data(
            self.transfer_id,
            self.msg_id,
            index,
            self.packets_per_chunk,
            payload_len,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use std::sync::Mutex;

    /// Collects datagrams instead of sending them.
    #[derive(Debug, Default)]
    struct CaptureSink {
        sent: Mutex<Vec<(u16, Vec<u8>)>>,
    }

    impl PacketSink for CaptureSink {
        fn send(&self, datagram: &[u8], channel: u16) -> io::Result<()> {
            self.sent.lock().unwrap().push((channel, datagram.to_vec()));
            Ok(())
        }
    }

    fn params(mtu: u32, ppc: u16, channels: u16) -> WireParams {
        WireParams {
            transfer_id: 11,
            mtu_bytes: mtu,
            packets_per_chunk: ppc,
            num_channels: channels,
            ..WireParams::default()
        }
    }

    #[test]
    fn test_burst_covers_message_with_short_tail() {
        let plane = DataPlane::new(CaptureSink::default(), &params(10, 2, 1), 3, None);
        let data = vec![7u8; 25];
        assert_eq!(plane.send_all(&data).unwrap(), 3);

        let sent = plane.sink().sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let last = PacketHeader::decode(&sent[2].1).unwrap();
        assert_eq!(last.payload_len, 5);
        assert_eq!(last.packet_offset, 2);
        assert_eq!(last.chunk_seq, 1);
    }

    #[test]
    fn test_round_robin_channels() {
        let plane = DataPlane::new(CaptureSink::default(), &params(10, 2, 3), 0, None);
        let data = vec![0u8; 60];
        plane.send_all(&data).unwrap();

        let sent = plane.sink().sent.lock().unwrap();
        let channels: Vec<u16> = sent.iter().map(|(c, _)| *c).collect();
        assert_eq!(channels, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_send_chunks_bounds() {
        let plane = DataPlane::new(CaptureSink::default(), &params(10, 2, 1), 0, None);
        let data = vec![0u8; 50]; // 5 packets, chunks: [0,1] [2,3] [4]
        let sent = plane.send_chunks(&data, [2u32, 0]).unwrap();
        assert_eq!(sent, 3); // chunk 2 has one packet, chunk 0 has two

        let captured = plane.sink().sent.lock().unwrap();
        let offsets: Vec<u32> = captured
            .iter()
            .map(|(_, wire)| PacketHeader::decode(wire).unwrap().packet_offset)
            .collect();
        assert_eq!(offsets, vec![4, 0, 1]);
    }

    #[test]
    fn test_parity_headers_past_data_region() {
        let ec = EcWire {
            fec_k: 2,
            fec_m: 2,
            data_chunks: 2,
        };
        let plane = DataPlane::new(CaptureSink::default(), &params(10, 1, 1), 0, Some(ec));
        // 4 chunks of one packet each: two data, two parity (stripe 0).
        let data = vec![0u8; 40];
        plane.send_all(&data).unwrap();

        let sent = plane.sink().sent.lock().unwrap();
        let headers: Vec<PacketHeader> = sent
            .iter()
            .map(|(_, wire)| PacketHeader::decode(wire).unwrap())
            .collect();
        assert_eq!(headers[0].packet_type, PacketType::Data);
        assert_eq!(headers[1].packet_type, PacketType::Data);
        assert_eq!(headers[2].packet_type, PacketType::Parity);
        assert_eq!(headers[2].parity_idx, 0);
        assert_eq!(headers[3].packet_type, PacketType::Parity);
        assert_eq!(headers[3].parity_idx, 1);
        assert_eq!(headers[3].submsg_id, 0);
        assert_eq!(headers[3].fec_k, 2);
    }

    #[test]
    fn test_lossy_sink_pattern() {
        let lossy = LossySink::with_pattern(CaptureSink::default(), 3);
        let plane = DataPlane::new(lossy, &params(10, 2, 1), 0, None);
        let data = vec![0u8; 90]; // 9 packets
        plane.send_all(&data).unwrap();

        assert_eq!(plane.sink().offered(), 9);
        let delivered = plane.sink().inner.sent.lock().unwrap();
        // Every 3rd datagram dropped: 3, 6, 9 -> 6 delivered.
        assert_eq!(delivered.len(), 6);
    }

    #[test]
    fn test_rejects_zero_mtu() {
        let plane = DataPlane::new(CaptureSink::default(), &params(0, 2, 1), 0, None);
        assert!(plane.send_range(&[0u8; 10], 0, 1).is_err());
    }
}
