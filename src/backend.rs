//! Multi-channel datagram intake.
//!
//! One worker thread per negotiated UDP channel. Workers loop on a bounded
//! (100 ms) receive so they can observe the cooperative stop flag, validate
//! each datagram, and deposit payload bytes into the owning message slot
//! through the claim/publish bitmap discipline. Chunk and message completion
//! are promoted inline and reported through the [`ProgressObserver`].
//!
//! Ordering: within one worker, packets are observed in receive order;
//! across workers there is no ordering. Correctness rests on the atomic
//! bitmaps and on payload writes to distinct packet offsets landing in
//! disjoint buffer regions.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bitmap::{ProgressObserver, SetOutcome};
use crate::connection::ConnState;
use crate::message::MessageState;
use crate::packet::{PacketHeader, HEADER_LEN, MAX_PAYLOAD};

/// How long a worker blocks in one receive call before polling the stop
/// flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Attempts to find a consecutive run of free ports when the base port is
/// OS-assigned.
const EPHEMERAL_BIND_ATTEMPTS: usize = 16;

/// Datagram-path drop counters. Drops are silent by design; the counters
/// are the only trace they leave.
#[derive(Debug, Default)]
pub struct BackendCounters {
    /// Packets accepted and written.
    pub received: AtomicU64,
    /// Short datagrams, bad magic, undecodable headers, offsets out of
    /// range.
    pub malformed: AtomicU64,
    /// No slot, slot not ACTIVE, or generation mismatch.
    pub stale: AtomicU64,
    /// Packet bit already set; payload write skipped.
    pub duplicate: AtomicU64,
}

/// Pool of datagram workers feeding the bitmap engine.
#[derive(Debug)]
pub struct Backend {
    counters: Arc<BackendCounters>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    base_port: u16,
    num_channels: u16,
}

impl Backend {
    /// Bind `num_channels` consecutive UDP ports starting at `base_port`
    /// (zero asks the OS for a free run) and start one worker per socket.
    pub fn start(
        conn: Arc<ConnState>,
        observer: Arc<dyn ProgressObserver>,
        base_port: u16,
        num_channels: u16,
    ) -> io::Result<Self> {
        let num_channels = num_channels.max(1);
        let (base_port, sockets) = bind_channels(base_port, num_channels)?;
        let counters = Arc::new(BackendCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let workers = sockets
            .into_iter()
            .enumerate()
            .map(|(i, socket)| {
                let conn = Arc::clone(&conn);
                let observer = Arc::clone(&observer);
                let counters = Arc::clone(&counters);
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("bulklink-udp-{i}"))
                    .spawn(move || worker_loop(socket, conn, observer, counters, stop))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!(base_port, num_channels, "backend started");
        Ok(Self {
            counters,
            stop,
            workers,
            base_port,
            num_channels,
        })
    }

    /// First bound UDP port; channels occupy `base..base + num_channels`.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Number of bound channels.
    pub fn num_channels(&self) -> u16 {
        self.num_channels
    }

    /// Drop counters shared with the workers.
    pub fn counters(&self) -> &BackendCounters {
        &self.counters
    }

    /// Signal the workers to stop and join them.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_channels(base_port: u16, num_channels: u16) -> io::Result<(u16, Vec<UdpSocket>)> {
    if base_port != 0 {
        let sockets = (0..num_channels)
            .map(|i| UdpSocket::bind(("0.0.0.0", base_port + i)))
            .collect::<io::Result<Vec<_>>>()?;
        return Ok((base_port, sockets));
    }

    // OS-assigned base: bind one ephemeral socket, then try to claim the
    // ports right after it so the channel fan-out stays `base + i`.
    for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
        let first = UdpSocket::bind(("0.0.0.0", 0))?;
        let port = first.local_addr()?.port();
        if u32::from(port) + u32::from(num_channels) > u32::from(u16::MAX) {
            continue;
        }
        let mut sockets = vec![first];
        for i in 1..num_channels {
            match UdpSocket::bind(("0.0.0.0", port + i)) {
                Ok(socket) => sockets.push(socket),
                Err(_) => break,
            }
        }
        if sockets.len() == usize::from(num_channels) {
            return Ok((port, sockets));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no consecutive run of free udp ports",
    ))
}

fn worker_loop(
    socket: UdpSocket,
    conn: Arc<ConnState>,
    observer: Arc<dyn ProgressObserver>,
    counters: Arc<BackendCounters>,
    stop: Arc<AtomicBool>,
) {
    if let Err(e) = socket.set_read_timeout(Some(RECV_TIMEOUT)) {
        warn!(error = %e, "failed to set receive timeout, worker exiting");
        return;
    }
    let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD];

    while !stop.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "udp receive failed, worker exiting");
                break;
            }
        };
        process_datagram(&conn, observer.as_ref(), &counters, &buf[..len]);
    }
}

/// Validate one datagram and feed it to the bitmap engine.
///
/// Exposed for tests that inject datagrams without a socket.
pub fn process_datagram(
    conn: &ConnState,
    observer: &dyn ProgressObserver,
    counters: &BackendCounters,
    datagram: &[u8],
) {
    let Some(header) = PacketHeader::decode(datagram) else {
        counters.malformed.fetch_add(1, Ordering::Relaxed);
        return;
    };

    // Trust the shorter of the framed length and what actually arrived.
    let wire_payload = &datagram[HEADER_LEN..];
    let payload_len = wire_payload.len().min(usize::from(header.payload_len));
    let payload = &wire_payload[..payload_len];

    let Some(slot) = conn.get_message(header.msg_id) else {
        counters.stale.fetch_add(1, Ordering::Relaxed);
        return;
    };
    if slot.state() != MessageState::Active || slot.generation() != header.transfer_id {
        counters.stale.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if !observer.on_packet(header.msg_id, header.packet_offset) {
        return;
    }

    match slot.packets.claim(header.packet_offset) {
        SetOutcome::OutOfRange => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        SetOutcome::Duplicate => {
            counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return;
        }
        SetOutcome::NewlySet => {}
    }

    slot.write_payload(header.packet_offset, payload);
    slot.packets.publish(header.packet_offset);
    counters.received.fetch_add(1, Ordering::Relaxed);

    // Promote chunk completion; the claim on the chunk bit keeps the
    // callbacks exactly-once across racing workers.
    let chunk_id = header.chunk_id();
    if slot.packets.is_chunk_complete(chunk_id) {
        if let Some(done) = slot.chunks.mark_complete(chunk_id) {
            observer.on_chunk_complete(header.msg_id, chunk_id);
            if done == slot.total_chunks() {
                slot.mark_completed();
                observer.on_message_complete(header.msg_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::WireParams;
    use crate::packet::encode_packet;
    use std::sync::Mutex;

    struct Recorder {
        chunks: Mutex<Vec<u32>>,
        messages: Mutex<Vec<u16>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProgressObserver for Recorder {
        fn on_chunk_complete(&self, _msg_id: u16, chunk_id: u32) {
            self.chunks.lock().unwrap().push(chunk_id);
        }
        fn on_message_complete(&self, msg_id: u16) {
            self.messages.lock().unwrap().push(msg_id);
        }
    }

    fn params(total_bytes: u64, mtu: u32, ppc: u16, transfer_id: u32) -> WireParams {
        WireParams {
            transfer_id,
            total_bytes,
            mtu_bytes: mtu,
            packets_per_chunk: ppc,
            ..WireParams::default()
        }
    }

    fn datagram(transfer_id: u32, msg_id: u16, offset: u32, ppc: u16, payload: &[u8]) -> Vec<u8> {
        let header =
            PacketHeader::data(transfer_id, msg_id, offset, ppc, payload.len()).unwrap();
        encode_packet(&header, payload)
    }

    #[test]
    fn test_full_message_through_datagram_path() {
        let conn = ConnState::new(1);
        let p = params(40, 10, 2, 7);
        conn.allocate_message_slot(3, 7, vec![0u8; 40].into(), p)
            .unwrap();
        let recorder = Recorder::new();
        let counters = BackendCounters::default();

        for offset in 0..4u32 {
            let payload = vec![offset as u8 + 1; 10];
            let wire = datagram(7, 3, offset, 2, &payload);
            process_datagram(&conn, &recorder, &counters, &wire);
        }

        assert_eq!(counters.received.load(Ordering::Relaxed), 4);
        assert_eq!(*recorder.chunks.lock().unwrap(), vec![0, 1]);
        assert_eq!(*recorder.messages.lock().unwrap(), vec![3]);

        let slot = conn.get_message(3).unwrap();
        assert_eq!(slot.state(), MessageState::Completed);
        let buffer = conn.complete_message(3).unwrap();
        assert_eq!(&buffer[0..10], &[1u8; 10]);
        assert_eq!(&buffer[30..40], &[4u8; 10]);
    }

    #[test]
    fn test_malformed_datagrams_counted() {
        let conn = ConnState::new(1);
        let recorder = Recorder::new();
        let counters = BackendCounters::default();

        // Short datagram.
        process_datagram(&conn, &recorder, &counters, &[0u8; 4]);
        // Bad magic.
        let mut wire = datagram(1, 0, 0, 2, &[0u8; 10]);
        wire[0] = 0xFF;
        process_datagram(&conn, &recorder, &counters, &wire);

        assert_eq!(counters.malformed.load(Ordering::Relaxed), 2);
        assert_eq!(counters.received.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stale_generation_dropped() {
        let conn = ConnState::new(1);
        conn.allocate_message_slot(5, 9, vec![0u8; 20].into(), params(20, 10, 2, 9))
            .unwrap();
        let recorder = Recorder::new();
        let counters = BackendCounters::default();

        // Packet stamped with the previous generation.
        let wire = datagram(8, 5, 0, 2, &[0xEE; 10]);
        process_datagram(&conn, &recorder, &counters, &wire);

        assert_eq!(counters.stale.load(Ordering::Relaxed), 1);
        let slot = conn.get_message(5).unwrap();
        assert!(!slot.packets.is_packet(0));
        let buffer = conn.complete_message(5).unwrap();
        assert_eq!(buffer[0], 0);
    }

    #[test]
    fn test_unknown_msg_id_dropped() {
        let conn = ConnState::new(1);
        let recorder = Recorder::new();
        let counters = BackendCounters::default();
        let wire = datagram(1, 17, 0, 2, &[1u8; 10]);
        process_datagram(&conn, &recorder, &counters, &wire);
        assert_eq!(counters.stale.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_duplicate_skips_payload_write() {
        let conn = ConnState::new(1);
        conn.allocate_message_slot(0, 1, vec![0u8; 20].into(), params(20, 10, 2, 1))
            .unwrap();
        let recorder = Recorder::new();
        let counters = BackendCounters::default();

        let first = datagram(1, 0, 0, 2, &[0xAA; 10]);
        process_datagram(&conn, &recorder, &counters, &first);
        let replay = datagram(1, 0, 0, 2, &[0xBB; 10]);
        process_datagram(&conn, &recorder, &counters, &replay);

        assert_eq!(counters.duplicate.load(Ordering::Relaxed), 1);
        let buffer = conn.complete_message(0).unwrap();
        // The replayed payload did not overwrite the original.
        assert_eq!(&buffer[0..10], &[0xAA; 10]);
    }

    #[test]
    fn test_dead_slot_rejects_packets() {
        let conn = ConnState::new(1);
        conn.allocate_message_slot(2, 4, vec![0u8; 20].into(), params(20, 10, 2, 4))
            .unwrap();
        conn.complete_message(2).unwrap();

        let recorder = Recorder::new();
        let counters = BackendCounters::default();
        let wire = datagram(4, 2, 0, 2, &[1u8; 10]);
        process_datagram(&conn, &recorder, &counters, &wire);
        assert_eq!(counters.stale.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_veto_hook_drops_packet() {
        struct Veto;
        impl ProgressObserver for Veto {
            fn on_packet(&self, _msg_id: u16, offset: u32) -> bool {
                offset != 1
            }
        }

        let conn = ConnState::new(1);
        conn.allocate_message_slot(0, 1, vec![0u8; 20].into(), params(20, 10, 2, 1))
            .unwrap();
        let counters = BackendCounters::default();

        process_datagram(&conn, &Veto, &counters, &datagram(1, 0, 0, 2, &[1u8; 10]));
        process_datagram(&conn, &Veto, &counters, &datagram(1, 0, 1, 2, &[2u8; 10]));

        let slot = conn.get_message(0).unwrap();
        assert!(slot.packets.is_packet(0));
        assert!(!slot.packets.is_packet(1));
    }

    #[test]
    fn test_backend_receives_over_socket() {
        let conn = Arc::new(ConnState::new(1));
        let p = params(40, 10, 2, 2);
        conn.allocate_message_slot(1, 2, vec![0u8; 40].into(), p)
            .unwrap();

        let mut backend = Backend::start(Arc::clone(&conn), Arc::new(()), 0, 2).unwrap();
        let base = backend.base_port();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        for offset in 0..4u32 {
            let wire = datagram(2, 1, offset, 2, &[offset as u8; 10]);
            let port = base + (offset % 2) as u16;
            tx.send_to(&wire, ("127.0.0.1", port)).unwrap();
        }

        let slot = conn.get_message(1).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !slot.chunks.is_all_complete() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        backend.stop();
        assert!(slot.chunks.is_all_complete());
        assert_eq!(backend.counters().received.load(Ordering::Relaxed), 4);
    }
}
