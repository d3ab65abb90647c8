//! Public API surface: contexts, connections, and transfer handles.
//!
//! A [`Context`] owns the message-id space. A [`Connection`] pairs one TCP
//! control stream with per-connection state; one side listens, the other
//! connects, and each connection moves one message at a time.
//!
//! `recv_post` blocks through OFFER → CTS → ACCEPT and spawns the datagram
//! backend; `send_post` blocks through the same handshake and performs the
//! initial burst. The reliability controllers in [`crate::reliability`]
//! drive these primitives; applications that can tolerate loss-free links
//! may use them directly.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendCounters};
use crate::bitmap::{ChunkBitmap, ProgressObserver};
use crate::connection::{geometry, ConnState};
use crate::control::{ControlFrame, ControlStream, ControlType, WireParams};
use crate::message::{MessageSlot, MsgIdAllocator};
use crate::packet::{MAX_PACKETS, MAX_PAYLOAD};
use crate::sender::{DataPlane, EcWire, PacketSink, UdpSink};
use crate::{Error, Result};

/// Default packets per chunk when neither side specifies one.
const DEFAULT_PACKETS_PER_CHUNK: u16 = 64;

/// Process-level state shared by every connection created from it.
#[derive(Debug, Default)]
pub struct Context {
    pub(crate) msg_ids: MsgIdAllocator,
    next_connection_id: AtomicU32,
}

impl Context {
    /// Create a fresh context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_connection_id(&self) -> u32 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

/// Wakes receiver pump loops when datagram workers make progress.
#[derive(Debug, Default)]
pub struct ProgressNotifier {
    state: Mutex<NotifierState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct NotifierState {
    events: u64,
    complete: bool,
}

impl ProgressNotifier {
    /// Block until any progress event lands or `timeout` elapses. Returns
    /// `true` if something happened.
    pub fn wait_change(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().expect("notifier poisoned");
        let seen = guard.events;
        if guard.complete {
            return true;
        }
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| s.events == seen && !s.complete)
            .expect("notifier poisoned");
        guard.events != seen || guard.complete
    }

    /// Whether `on_message_complete` has fired.
    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("notifier poisoned").complete
    }
}

impl ProgressObserver for ProgressNotifier {
    fn on_chunk_complete(&self, _msg_id: u16, _chunk_id: u32) {
        let mut guard = self.state.lock().expect("notifier poisoned");
        guard.events += 1;
        self.cv.notify_all();
    }

    fn on_message_complete(&self, _msg_id: u16) {
        let mut guard = self.state.lock().expect("notifier poisoned");
        guard.events += 1;
        guard.complete = true;
        self.cv.notify_all();
    }
}

/// One control stream plus the per-connection message table.
#[derive(Debug)]
pub struct Connection {
    pub(crate) ctx: Arc<Context>,
    state: Arc<ConnState>,
    control: Mutex<ControlStream>,
    role: Role,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    auto_send: AtomicBool,
}

impl Connection {
    /// Receiver side: listen on `tcp_port` and accept one peer.
    pub fn listen(ctx: &Arc<Context>, tcp_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", tcp_port))?;
        Self::listen_on(ctx, listener)
    }

    /// Receiver side: accept one peer from an already-bound listener.
    pub fn listen_on(ctx: &Arc<Context>, listener: TcpListener) -> Result<Self> {
        let (stream, peer_addr) = listener.accept()?;
        info!(%peer_addr, "control peer connected");
        Self::from_stream(ctx, stream, peer_addr, Role::Receiver)
    }

    /// Sender side: connect to the receiver's control port.
    pub fn connect(ctx: &Arc<Context>, ip: &str, tcp_port: u16) -> Result<Self> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::InvalidConfig("unparseable receiver ip"))?;
        let stream = TcpStream::connect((ip, tcp_port))?;
        let peer_addr = stream.peer_addr()?;
        info!(%peer_addr, "connected to control peer");
        Self::from_stream(ctx, stream, peer_addr, Role::Sender)
    }

    fn from_stream(
        ctx: &Arc<Context>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        role: Role,
    ) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let connection_id = ctx.next_connection_id();
        Ok(Self {
            ctx: Arc::clone(ctx),
            state: Arc::new(ConnState::new(connection_id)),
            control: Mutex::new(ControlStream::new(stream)),
            role,
            peer_addr,
            local_addr,
            auto_send: AtomicBool::new(true),
        })
    }

    /// Connection identifier carried in control frames.
    pub fn connection_id(&self) -> u32 {
        self.state.connection_id()
    }

    /// Shared per-connection state.
    pub fn state(&self) -> &Arc<ConnState> {
        &self.state
    }

    /// Set connection-wide default parameters consulted during negotiation.
    pub fn set_params(&self, params: WireParams) {
        self.state.set_params(params);
    }

    /// Snapshot of the connection parameters.
    pub fn params(&self) -> WireParams {
        self.state.params()
    }

    /// Whether `send_post` performs the initial burst. The EC fallback path
    /// disables this so SR can drive transmission explicitly.
    pub fn auto_send(&self) -> bool {
        self.auto_send.load(Ordering::Acquire)
    }

    /// Enable or disable the automatic initial burst.
    pub fn set_auto_send(&self, enabled: bool) {
        self.auto_send.store(enabled, Ordering::Release);
    }

    /// Send one control frame.
    pub fn send_control(&self, frame: &ControlFrame) -> Result<()> {
        let mut control = self.control.lock().expect("control stream poisoned");
        control.send(frame)?;
        Ok(())
    }

    /// Receive one control frame, blocking.
    pub fn recv_control(&self) -> Result<ControlFrame> {
        let mut control = self.control.lock().expect("control stream poisoned");
        Ok(control.recv()?)
    }

    /// Receive one control frame, or `None` on timeout.
    pub fn recv_control_timeout(&self, timeout: Duration) -> Result<Option<ControlFrame>> {
        let mut control = self.control.lock().expect("control stream poisoned");
        Ok(control.recv_timeout(timeout)?)
    }

    /// Block until a frame of type `want` arrives, skipping stale control
    /// traffic the way the handshake requires.
    fn wait_for(&self, want: ControlType, expected: &'static str) -> Result<ControlFrame> {
        loop {
            let frame = match self.recv_control() {
                Ok(frame) => frame,
                Err(Error::TransportLost(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(Error::HandshakeDesync { expected });
                }
                Err(e) => return Err(e),
            };
            if frame.control_type == want {
                return Ok(frame);
            }
            if frame.control_type == ControlType::Reject {
                return Err(Error::HandshakeRejected);
            }
            debug!(got = ?frame.control_type, expected, "skipping unexpected control message");
        }
    }

    /// Post a receive buffer: wait for OFFER, finalize parameters, bind the
    /// datagram backend, answer CTS, and wait for ACCEPT.
    ///
    /// The buffer must be at least as large as the transfer the sender
    /// offers (for erasure-coded transfers that includes the parity
    /// region).
    pub fn recv_post(&self, buffer: Vec<u8>) -> Result<RecvHandle<'_>> {
        if self.role != Role::Receiver {
            return Err(Error::InvalidConfig("recv_post on a sender connection"));
        }

        let offer = self.wait_for(ControlType::Offer, "OFFER")?;
        let (msg_id, generation) = match self.ctx.msg_ids.allocate() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = self.send_control(&ControlFrame::new(
                    ControlType::Reject,
                    self.connection_id(),
                ));
                return Err(e);
            }
        };

        match self.recv_post_inner(buffer, &offer, msg_id, generation) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.ctx.msg_ids.free(msg_id);
                let _ = self.send_control(&ControlFrame::new(
                    ControlType::Reject,
                    self.connection_id(),
                ));
                Err(e)
            }
        }
    }

    fn recv_post_inner(
        &self,
        buffer: Vec<u8>,
        offer: &ControlFrame,
        msg_id: u16,
        generation: u32,
    ) -> Result<RecvHandle<'_>> {
        let mut params = self.negotiate(offer, buffer.len(), generation)?;
        if (buffer.len() as u64) < params.total_bytes {
            return Err(Error::InvalidConfig(
                "receive buffer shorter than offered transfer",
            ));
        }

        let notifier = Arc::new(ProgressNotifier::default());
        let backend = Backend::start(
            Arc::clone(&self.state),
            Arc::clone(&notifier) as Arc<dyn ProgressObserver>,
            params.channel_base_port,
            params.num_channels,
        )?;
        params.channel_base_port = backend.base_port();
        params.udp_server_port = backend.base_port();
        if let IpAddr::V4(ip) = self.local_addr.ip() {
            params.set_server_ip(ip);
        }

        let slot =
            self.state
                .allocate_message_slot(msg_id, generation, buffer.into_boxed_slice(), params)?;
        self.state.set_params(params);

        info!(
            msg_id,
            generation,
            total_bytes = params.total_bytes,
            total_packets = slot.total_packets(),
            total_chunks = slot.total_chunks(),
            base_port = params.channel_base_port,
            channels = params.num_channels,
            "receive posted"
        );

        let mut cts = ControlFrame::new(ControlType::Cts, self.connection_id());
        cts.params = params;
        let confirmed = self
            .send_control(&cts)
            .and_then(|()| self.wait_for(ControlType::Accept, "ACCEPT"));
        if let Err(e) = confirmed {
            // Retire the slot so the id can be reused with a fresh
            // generation.
            self.state.complete_message(msg_id);
            return Err(e);
        }

        Ok(RecvHandle {
            conn: self,
            slot,
            backend,
            notifier,
        })
    }

    /// Compute the finalized parameter block from an OFFER and local
    /// defaults.
    fn negotiate(
        &self,
        offer: &ControlFrame,
        buffer_len: usize,
        generation: u32,
    ) -> Result<WireParams> {
        let defaults = self.state.params();
        let mut p = defaults;

        p.total_bytes = if offer.params.total_bytes != 0 {
            offer.params.total_bytes
        } else {
            buffer_len as u64
        };
        let proposed_mtu = pick(offer.params.mtu_bytes, defaults.mtu_bytes, MAX_PAYLOAD as u32);
        p.mtu_bytes = proposed_mtu.min(MAX_PAYLOAD as u32);
        p.packet_bytes = p.mtu_bytes;
        p.packets_per_chunk = pick(
            u32::from(offer.params.packets_per_chunk),
            u32::from(defaults.packets_per_chunk),
            u32::from(DEFAULT_PACKETS_PER_CHUNK),
        ) as u16;
        p.num_channels = pick(
            u32::from(offer.params.num_channels),
            u32::from(defaults.num_channels),
            1,
        )
        .min(64) as u16;
        p.chunk_bytes = p.mtu_bytes * u32::from(p.packets_per_chunk);
        p.fec_k = offer.params.fec_k;
        p.fec_m = offer.params.fec_m;
        p.rto_ms = pick(offer.params.rto_ms, defaults.rto_ms, 0);
        p.rtt_alpha_ms = pick(offer.params.rtt_alpha_ms, defaults.rtt_alpha_ms, 0);
        p.max_inflight = pick(offer.params.max_inflight, defaults.max_inflight, 0);
        p.transfer_id = generation;

        let (total_packets, total_chunks) =
            geometry(p.total_bytes, p.mtu_bytes, p.packets_per_chunk);
        if total_packets > MAX_PACKETS {
            return Err(Error::InvalidConfig(
                "transfer needs more packets than the offset field can index",
            ));
        }
        p.total_chunks = total_chunks;
        Ok(p)
    }

    /// Post a send: OFFER → CTS → ACCEPT, then the initial burst across the
    /// negotiated channels (unless auto-send is disabled).
    pub fn send_post<'a>(&'a self, data: &[u8]) -> Result<SendHandle<'a, UdpSink>> {
        self.send_post_opts(data, None, None, UdpSink::new)
    }

    /// `send_post` with erasure-coding layout, pacing, and a custom sink
    /// factory (the factory receives the destination IP and base port).
    pub fn send_post_opts<'a, S, F>(
        &'a self,
        data: &[u8],
        ec: Option<EcWire>,
        pace: Option<Duration>,
        make_sink: F,
    ) -> Result<SendHandle<'a, S>>
    where
        S: PacketSink,
        F: FnOnce(Ipv4Addr, u16) -> io::Result<S>,
    {
        let (msg_id, params, ip, base_port) =
            self.sender_handshake(data.len() as u64, ec.map(|e| (e.fec_k, e.fec_m)))?;

        let sink = make_sink(ip, base_port)?;
        let mut plane = DataPlane::new(sink, &params, msg_id, ec);
        plane.set_pace(pace);

        let mut handle = SendHandle {
            conn: self,
            msg_id,
            params,
            plane,
            packets_sent: 0,
            released: false,
        };
        if self.auto_send() {
            handle.packets_sent = handle.plane.send_all(data)?;
            info!(
                msg_id,
                packets = handle.packets_sent,
                "initial burst sent"
            );
        }
        Ok(handle)
    }

    /// Start a streaming send: full handshake, no burst. Packets are pushed
    /// explicitly through [`StreamHandle::send_bytes`], which is how partial
    /// retransmission works without re-handshaking.
    pub fn stream_start(&self, total_bytes: u64) -> Result<StreamHandle<'_, UdpSink>> {
        let (msg_id, params, ip, base_port) = self.sender_handshake(total_bytes, None)?;
        let sink = UdpSink::new(ip, base_port)?;
        let plane = DataPlane::new(sink, &params, msg_id, None);
        Ok(StreamHandle {
            conn: self,
            msg_id,
            params,
            plane,
            packets_sent: 0,
            active: true,
            released: false,
        })
    }

    fn sender_handshake(
        &self,
        total_bytes: u64,
        fec: Option<(u16, u16)>,
    ) -> Result<(u16, WireParams, Ipv4Addr, u16)> {
        if self.role != Role::Sender {
            return Err(Error::InvalidConfig("send on a receiver connection"));
        }

        let mut offer = ControlFrame::new(ControlType::Offer, self.connection_id());
        offer.params = self.state.params();
        offer.params.total_bytes = total_bytes;
        if let Some((k, m)) = fec {
            offer.params.fec_k = k;
            offer.params.fec_m = m;
        }
        self.send_control(&offer)?;

        let cts = self.wait_for(ControlType::Cts, "CTS")?;
        let params = cts.params;
        if params.mtu_bytes == 0 || params.packets_per_chunk == 0 {
            return Err(Error::InvalidConfig("peer finalized zero mtu or chunking"));
        }
        self.state.set_params(params);

        let mut accept = ControlFrame::new(ControlType::Accept, self.connection_id());
        accept.params = params;
        self.send_control(&accept)?;

        let (msg_id, _) = self.ctx.msg_ids.allocate()?;

        let ip = match params.server_ip() {
            Some(ip) => ip,
            None => match self.peer_addr.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => {
                    return Err(Error::InvalidConfig("no ipv4 datagram destination"))
                }
            },
        };
        let base_port = if params.channel_base_port != 0 {
            params.channel_base_port
        } else {
            params.udp_server_port
        };
        if base_port == 0 {
            return Err(Error::InvalidConfig("peer finalized no datagram port"));
        }

        info!(
            msg_id,
            transfer_id = params.transfer_id,
            %ip,
            base_port,
            channels = params.num_channels,
            "handshake complete"
        );
        Ok((msg_id, params, ip, base_port))
    }
}

/// Receiver-side handle for one posted message.
#[derive(Debug)]
pub struct RecvHandle<'a> {
    conn: &'a Connection,
    slot: Arc<MessageSlot>,
    backend: Backend,
    notifier: Arc<ProgressNotifier>,
}

impl<'a> RecvHandle<'a> {
    /// Message id assigned to this transfer.
    pub fn msg_id(&self) -> u16 {
        self.slot.msg_id()
    }

    /// Parameters frozen for this transfer.
    pub fn params(&self) -> WireParams {
        *self.slot.params()
    }

    /// Chunk-completion bitmap.
    pub fn chunks(&self) -> &ChunkBitmap {
        &self.slot.chunks
    }

    /// Non-owning snapshot of the chunk bitmap words.
    pub fn chunk_bitmap(&self) -> Vec<u64> {
        self.slot.chunks.snapshot()
    }

    /// Datagram-path drop counters.
    pub fn counters(&self) -> &BackendCounters {
        self.backend.counters()
    }

    /// Whether every chunk has been received.
    pub fn is_complete(&self) -> bool {
        self.slot.chunks.is_all_complete()
    }

    /// Block until the workers report progress or `timeout` elapses.
    pub fn wait_progress(&self, timeout: Duration) -> bool {
        self.notifier.wait_change(timeout)
    }

    /// Stop the backend, transition the slot to DEAD, and emit
    /// COMPLETE_ACK or INCOMPLETE_NACK depending on whether every chunk
    /// arrived.
    pub fn complete(self) -> Result<Vec<u8>> {
        let ok = self.is_complete();
        self.complete_as(ok)
    }

    /// Like [`complete`](Self::complete) but with the completion verdict
    /// supplied by the caller (the EC receiver completes successfully with
    /// parity chunks still missing).
    pub fn complete_as(self, ok: bool) -> Result<Vec<u8>> {
        let conn = self.conn;
        let connection_id = conn.connection_id();
        let (buffer, _) = self.teardown();
        let verdict = if ok {
            ControlType::CompleteAck
        } else {
            ControlType::IncompleteNack
        };
        if let Err(e) = conn.send_control(&ControlFrame::new(verdict, connection_id)) {
            warn!(error = %e, "completion notification failed");
        }
        if ok {
            Ok(buffer)
        } else {
            Err(Error::IncompleteTransfer)
        }
    }

    /// Stop the backend and reclaim the buffer without emitting any control
    /// message. Returns the buffer and whether every chunk arrived. The EC
    /// receiver uses this to reconstruct before acknowledging.
    pub fn finish_quiet(self) -> (Vec<u8>, bool) {
        self.teardown()
    }

    fn teardown(mut self) -> (Vec<u8>, bool) {
        self.backend.stop();
        let ok = self.slot.chunks.is_all_complete();
        let msg_id = self.slot.msg_id();
        let mut buffer = self
            .conn
            .state
            .complete_message(msg_id)
            .map(|b| b.into_vec())
            .unwrap_or_default();
        // The posted buffer may be larger than the negotiated transfer.
        buffer.truncate(self.slot.params().total_bytes as usize);
        self.conn.ctx.msg_ids.bump_generation(msg_id);
        self.conn.ctx.msg_ids.free(msg_id);
        (buffer, ok)
    }
}

/// Sender-side handle for one posted message.
///
/// The message id goes back to the context's allocator when the transfer's
/// fate is known ([`poll`](Self::poll)) or when the handle drops.
#[derive(Debug)]
pub struct SendHandle<'a, S: PacketSink = UdpSink> {
    conn: &'a Connection,
    msg_id: u16,
    params: WireParams,
    plane: DataPlane<S>,
    packets_sent: u64,
    released: bool,
}

impl<'a, S: PacketSink> SendHandle<'a, S> {
    /// Message id assigned to this transfer.
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Negotiated parameters.
    pub fn params(&self) -> &WireParams {
        &self.params
    }

    /// Packets pushed so far, including retransmissions.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Retransmit whole chunks of `data`.
    pub fn resend_chunks<I>(&mut self, data: &[u8], chunks: I) -> Result<u64>
    where
        I: IntoIterator<Item = u32>,
    {
        let sent = self.plane.send_chunks(data, chunks)?;
        self.packets_sent += sent;
        Ok(sent)
    }

    /// Send every packet once (used when the burst was deferred).
    pub fn send_all(&mut self, data: &[u8]) -> Result<u64> {
        let sent = self.plane.send_all(data)?;
        self.packets_sent += sent;
        Ok(sent)
    }

    /// Block until the receiver reports the transfer's fate. Either way the
    /// message id is retired for reuse.
    pub fn poll(&mut self) -> Result<()> {
        loop {
            let frame = self.conn.recv_control()?;
            match frame.control_type {
                ControlType::CompleteAck | ControlType::EcAck => {
                    self.release();
                    return Ok(());
                }
                ControlType::IncompleteNack => {
                    self.release();
                    return Err(Error::IncompleteTransfer);
                }
                other => {
                    debug!(got = ?other, "ignoring control message while awaiting completion")
                }
            }
        }
    }

    /// Completion processing for the sender side: bump the id's generation
    /// and return it to the allocator, mirroring the receiver's teardown.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.conn.ctx.msg_ids.bump_generation(self.msg_id);
        self.conn.ctx.msg_ids.free(self.msg_id);
    }
}

impl<'a, S: PacketSink> Drop for SendHandle<'a, S> {
    fn drop(&mut self) {
        // Controllers that learn the transfer's fate from their own control
        // loop never call `poll`; the id still goes back.
        self.release();
    }
}

/// Streaming send handle: explicit byte-range transmission over an
/// established handshake.
#[derive(Debug)]
pub struct StreamHandle<'a, S: PacketSink = UdpSink> {
    conn: &'a Connection,
    msg_id: u16,
    params: WireParams,
    plane: DataPlane<S>,
    packets_sent: u64,
    active: bool,
    released: bool,
}

impl<'a, S: PacketSink> StreamHandle<'a, S> {
    /// Message id assigned to this transfer.
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Negotiated parameters.
    pub fn params(&self) -> &WireParams {
        &self.params
    }

    /// Packets pushed so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Send the packets covering bytes `offset..offset + len` of `data`.
    pub fn send_bytes(&mut self, data: &[u8], offset: u64, len: u64) -> Result<u64> {
        if !self.active {
            return Err(Error::InvalidConfig("stream already ended"));
        }
        let mtu = u64::from(self.params.mtu_bytes);
        if mtu == 0 {
            return Err(Error::InvalidConfig("mtu out of range"));
        }
        let start = (offset / mtu) as u32;
        let end = ((offset + len + mtu - 1) / mtu) as u32;
        let sent = self.plane.send_range(data, start, end)?;
        self.packets_sent += sent;
        Ok(sent)
    }

    /// Finish the stream and retire the message id.
    pub fn end(mut self) {
        self.active = false;
        self.release();
    }

    /// Completion processing for the sender side: bump the id's generation
    /// and return it to the allocator.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.conn.ctx.msg_ids.bump_generation(self.msg_id);
        self.conn.ctx.msg_ids.free(self.msg_id);
    }
}

impl<'a, S: PacketSink> Drop for StreamHandle<'a, S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// First non-zero choice, falling back to `fallback`.
fn pick(offered: u32, local: u32, fallback: u32) -> u32 {
    if offered != 0 {
        offered
    } else if local != 0 {
        local
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_precedence() {
        assert_eq!(pick(5, 3, 1), 5);
        assert_eq!(pick(0, 3, 1), 3);
        assert_eq!(pick(0, 0, 1), 1);
    }

    #[test]
    fn test_notifier_wait() {
        let notifier = Arc::new(ProgressNotifier::default());
        assert!(!notifier.wait_change(Duration::from_millis(10)));

        let n = Arc::clone(&notifier);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            n.on_chunk_complete(0, 0);
        });
        assert!(notifier.wait_change(Duration::from_secs(2)));
        handle.join().unwrap();

        notifier.on_message_complete(0);
        assert!(notifier.is_complete());
        // Complete flag satisfies future waits immediately.
        assert!(notifier.wait_change(Duration::from_millis(1)));
    }
}
