//! End-to-end transfer scenarios over loopback sockets.
//!
//! Each test pairs a receiver thread with sender-side calls on the test
//! thread: real TCP handshake, real UDP datagrams, loss injected at the
//! sender's packet sink.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;

use bulklink::backend::{process_datagram, BackendCounters};
use bulklink::connection::ConnState;
use bulklink::packet::{encode_packet, PacketHeader};
use bulklink::reliability::{
    EcConfig, EcReceiver, EcSender, EcStats, SrConfig, SrReceiver, SrSender, SrStats,
};
use bulklink::sender::{LossySink, PacketSink, UdpSink};
use bulklink::{Connection, Context, Error, WireParams};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn wire_params(mtu: u32, ppc: u16, channels: u16) -> WireParams {
    WireParams {
        mtu_bytes: mtu,
        packets_per_chunk: ppc,
        num_channels: channels,
        ..WireParams::default()
    }
}

fn sr_config() -> SrConfig {
    SrConfig::low_latency()
}

/// Spawn a receiver thread running the SR controller.
fn spawn_sr_receiver(
    params: WireParams,
    buffer_len: usize,
    cfg: SrConfig,
) -> (u16, thread::JoinHandle<Result<(Vec<u8>, SrStats), Error>>) {
    let (port_tx, port_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let ctx = Context::new();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind control listener");
        port_tx
            .send(listener.local_addr().unwrap().port())
            .expect("report port");
        let conn = Connection::listen_on(&ctx, listener)?;
        conn.set_params(params);
        let mut rx = SrReceiver::new(cfg);
        let data = rx.run(&conn, vec![0u8; buffer_len])?;
        Ok((data, *rx.stats()))
    });
    let port = port_rx.recv().expect("receiver port");
    (port, handle)
}

#[test]
fn test_lossless_sr_transfer() {
    // 1 MiB, mtu 1024, 32 packets per chunk, one channel: 1024 packets in
    // 32 chunks, no loss, no retransmission.
    let params = wire_params(1024, 32, 1);
    let data = random_bytes(1 << 20);
    let (port, receiver) = spawn_sr_receiver(params, data.len(), sr_config());

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = SrSender::new(sr_config());
    tx.run(&conn, &data).unwrap();

    let (received, _) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
    assert_eq!(tx.stats().retransmits, 0);
}

#[test]
fn test_sr_recovers_from_packet_loss() {
    // Drop every 17th datagram on the way out; SR NACKs must fill the gaps.
    let params = wire_params(1024, 8, 1);
    let data = random_bytes(256 * 1024);
    let (port, receiver) = spawn_sr_receiver(params, data.len(), sr_config());

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = SrSender::new(sr_config());
    tx.run_with_sink(&conn, &data, |ip, base| {
        Ok(LossySink::with_pattern(UdpSink::new(ip, base)?, 17))
    })
    .unwrap();

    let (received, rx_stats) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
    assert!(tx.stats().retransmits > 0);
    assert!(rx_stats.nacks_sent > 0);
}

#[test]
fn test_multi_channel_transfer() {
    let params = wire_params(1024, 8, 3);
    let data = random_bytes(96 * 1024);
    let (port, receiver) = spawn_sr_receiver(params, data.len(), sr_config());

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = SrSender::new(sr_config());
    tx.run(&conn, &data).unwrap();

    let (received, _) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
}

#[test]
fn test_zero_length_message() {
    // Handshake completes, no packets fly, COMPLETE_ACK is immediate.
    let params = wire_params(1024, 32, 1);
    let (port, receiver) = spawn_sr_receiver(params, 0, sr_config());

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = SrSender::new(sr_config());
    tx.run(&conn, &[]).unwrap();

    let (received, _) = receiver.join().unwrap().unwrap();
    assert!(received.is_empty());
    assert_eq!(tx.stats().retransmits, 0);
}

#[test]
fn test_sub_mtu_message() {
    // A 100-byte message travels as exactly one short packet.
    let params = wire_params(1024, 32, 1);
    let data = random_bytes(100);
    let (port, receiver) = spawn_sr_receiver(params, data.len(), sr_config());

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = SrSender::new(sr_config());
    tx.run(&conn, &data).unwrap();

    let (received, _) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
}

#[test]
fn test_progress_timeout_surfaces_incomplete() {
    // The sender delivers half the message and stalls; the receiver must
    // give up after its progress timeout and report the failure.
    let params = wire_params(1024, 8, 1);
    let data = random_bytes(64 * 1024);
    let cfg = SrConfig {
        progress_timeout_ms: 700,
        ..sr_config()
    };
    let (port, receiver) = spawn_sr_receiver(params, data.len(), cfg);

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut stream = conn.stream_start(data.len() as u64).unwrap();
    stream
        .send_bytes(&data, 0, data.len() as u64 / 2)
        .unwrap();

    // Keep the control stream open until the receiver decides.
    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(Error::IncompleteTransfer)));
    stream.end();
}

/// Sink that eats the first `times` transmissions of a fixed set of packet
/// offsets, then passes them through.
struct DropTimes {
    inner: UdpSink,
    remaining: Mutex<HashMap<u32, u32>>,
}

impl DropTimes {
    fn new(inner: UdpSink, offsets: impl IntoIterator<Item = u32>, times: u32) -> Self {
        Self {
            inner,
            remaining: Mutex::new(offsets.into_iter().map(|o| (o, times)).collect()),
        }
    }
}

impl PacketSink for DropTimes {
    fn send(&self, datagram: &[u8], channel: u16) -> io::Result<()> {
        if let Some(header) = PacketHeader::decode(datagram) {
            let mut remaining = self.remaining.lock().unwrap();
            if let Some(count) = remaining.get_mut(&header.packet_offset) {
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
            }
        }
        self.inner.send(datagram, channel)
    }
}

/// Spawn a receiver thread running the EC controller.
fn spawn_ec_receiver(
    params: WireParams,
    buffer_len: usize,
    cfg: EcConfig,
) -> (u16, thread::JoinHandle<Result<(Vec<u8>, EcStats), Error>>) {
    let (port_tx, port_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let ctx = Context::new();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind control listener");
        port_tx
            .send(listener.local_addr().unwrap().port())
            .expect("report port");
        let conn = Connection::listen_on(&ctx, listener)?;
        conn.set_params(params);
        let mut rx = EcReceiver::new(cfg);
        let data = rx.run(&conn, vec![0u8; buffer_len])?;
        Ok((data, *rx.stats()))
    });
    let port = port_rx.recv().expect("receiver port");
    (port, handle)
}

#[test]
fn test_ec_decode_recovers_dropped_chunks() {
    // 32 KiB in 4 KiB chunks (mtu 512 x 8 packets), k=4 m=2: 8 data chunks
    // in two stripes plus 4 parity chunks. Dropping data chunks 1 and 2
    // leaves stripe 0 with exactly k survivors, so the receiver decodes
    // without any retransmission.
    let params = wire_params(512, 8, 1);
    let data = random_bytes(32 * 1024);
    let cfg = EcConfig {
        k: 4,
        m: 2,
        data_bytes: data.len() as u64,
        sr: sr_config(),
        ..EcConfig::default()
    };
    // data(8) + parity(4) chunks, 4096 bytes each
    let (port, receiver) = spawn_ec_receiver(params, 12 * 4096, cfg);

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = EcSender::new(cfg);
    tx.run_with_sink(&conn, &data, |ip, base| {
        // Chunks 1 and 2 are packets 8..24.
        Ok(DropTimes::new(UdpSink::new(ip, base)?, 8..24, 1))
    })
    .unwrap();

    let (received, rx_stats) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
    assert!(rx_stats.decode_success >= 1);
    assert_eq!(rx_stats.fallback_sr, 0);
}

#[test]
fn test_ec_falls_back_to_sr_when_loss_exceeds_parity() {
    // Same geometry, but stripe 0 loses three data chunks and one of its
    // parity chunks: 4 missing > m, undecodable. The receiver NACKs, gives
    // up after max_retries epochs, and the transfer completes under SR.
    let params = wire_params(512, 8, 1);
    let data = random_bytes(32 * 1024);
    let cfg = EcConfig {
        k: 4,
        m: 2,
        data_bytes: data.len() as u64,
        max_retries: 1,
        sr: sr_config(),
        ..EcConfig::default()
    };
    let (port, receiver) = spawn_ec_receiver(params, 12 * 4096, cfg);

    let ctx = Context::new();
    let conn = Connection::connect(&ctx, "127.0.0.1", port).unwrap();
    conn.set_params(params);
    let mut tx = EcSender::new(cfg);
    tx.run_with_sink(&conn, &data, |ip, base| {
        // Data chunks 0..3 are packets 0..24; parity chunk 8 is packets
        // 64..72. The loss persists through the EC_NACK round so the
        // receiver exhausts its retries and falls back.
        let dropped = (0..24).chain(64..72);
        Ok(DropTimes::new(UdpSink::new(ip, base)?, dropped, 2))
    })
    .unwrap();

    let (received, rx_stats) = receiver.join().unwrap().unwrap();
    assert_eq!(received, data);
    assert_eq!(rx_stats.fallback_sr, 1);
}

#[test]
fn test_msg_ids_recycle_across_transfers() {
    // Sequential transfers over one shared context pair must keep reusing
    // id 0: both the receiver's teardown and the sender's completion
    // processing return the id to the allocator.
    let rx_ctx = Context::new();
    let tx_ctx = Context::new();
    let params = wire_params(1024, 8, 1);
    let data = random_bytes(4096);

    for round in 0..2 {
        let (port_tx, port_rx) = mpsc::channel();
        let rx_ctx = Arc::clone(&rx_ctx);
        let expected = data.clone();
        let receiver = thread::spawn(move || {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            port_tx
                .send(listener.local_addr().unwrap().port())
                .unwrap();
            let conn = Connection::listen_on(&rx_ctx, listener).unwrap();
            conn.set_params(params);
            let handle = conn.recv_post(vec![0u8; expected.len()]).unwrap();
            let msg_id = handle.msg_id();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !handle.is_complete() && Instant::now() < deadline {
                handle.wait_progress(Duration::from_millis(20));
            }
            assert_eq!(handle.complete().unwrap(), expected);
            msg_id
        });

        let port = port_rx.recv().unwrap();
        let conn = Connection::connect(&tx_ctx, "127.0.0.1", port).unwrap();
        conn.set_params(params);
        let mut handle = conn.send_post(&data).unwrap();
        assert_eq!(handle.msg_id(), 0, "sender id not recycled in round {round}");
        handle.poll().unwrap();
        drop(handle);

        let rx_id = receiver.join().unwrap();
        assert_eq!(rx_id, 0, "receiver id not recycled in round {round}");
    }
}

#[test]
fn test_late_packet_across_generations() {
    // Complete transfer A on msg_id 5, reuse the slot for transfer B with a
    // fresh generation, then inject a delayed packet from A. The stale
    // generation must keep it away from B's buffer and bitmap.
    let conn = ConnState::new(1);
    let params_a = WireParams {
        transfer_id: 10,
        total_bytes: 40,
        mtu_bytes: 10,
        packets_per_chunk: 2,
        ..WireParams::default()
    };
    let counters = BackendCounters::default();

    conn.allocate_message_slot(5, 10, vec![0u8; 40].into(), params_a)
        .unwrap();
    for offset in 0..4u32 {
        let header = PacketHeader::data(10, 5, offset, 2, 10).unwrap();
        process_datagram(&conn, &(), &counters, &encode_packet(&header, &[0xAA; 10]));
    }
    let a = conn.complete_message(5).unwrap();
    assert_eq!(&a[..], &[0xAA; 40][..]);

    let params_b = WireParams {
        transfer_id: 11,
        ..params_a
    };
    conn.allocate_message_slot(5, 11, vec![0u8; 40].into(), params_b)
        .unwrap();

    // Delayed packet from transfer A arrives on the same msg_id.
    let late = PacketHeader::data(10, 5, 0, 2, 10).unwrap();
    process_datagram(&conn, &(), &counters, &encode_packet(&late, &[0xDD; 10]));

    let slot = conn.get_message(5).unwrap();
    assert!(!slot.packets.is_packet(0));

    // Transfer B proceeds untouched.
    for offset in 0..4u32 {
        let header = PacketHeader::data(11, 5, offset, 2, 10).unwrap();
        process_datagram(&conn, &(), &counters, &encode_packet(&header, &[0xBB; 10]));
    }
    let b = conn.complete_message(5).unwrap();
    assert_eq!(&b[..], &[0xBB; 40][..]);
    assert_eq!(
        counters.stale.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn test_sink_address_types() {
    // UdpSink construction against loopback succeeds with a plain port.
    let sink = UdpSink::new(Ipv4Addr::LOCALHOST, 40000).unwrap();
    sink.send(&[0u8; 8], 0).unwrap();
}
