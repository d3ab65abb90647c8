//! Erasure-coding controllers.
//!
//! A message of `data_bytes` is cut into chunks of exactly
//! `mtu_bytes * packets_per_chunk` bytes; `k` consecutive data chunks form a
//! stripe that yields `m` parity chunks. The wire layout is
//! `[data_0 .. data_{D-1} | parity(stripe 0) .. parity(stripe S-1)]`, all
//! tracked by a single bitmap. The last stripe is zero-padded to `k` chunks
//! for encoding; the padding occupies no chunk indices and is never
//! transmitted.
//!
//! The GF(2^8) arithmetic lives in `reed-solomon-erasure`; this module only
//! orchestrates stripes, survivor selection, and the fallback decision.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, info};

use std::time::{Duration, Instant};

use crate::api::{Connection, RecvHandle};
use crate::control::{ControlFrame, ControlType, GAP_SLOTS};
use crate::packet::MAX_PAYLOAD;
use crate::sender::{EcWire, UdpSink};
use crate::{Error, Result};

use super::{EcConfig, EcStats, SrReceiver, SrSender};

/// Stripe geometry derived from the data length and chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcGeometry {
    /// Bytes per chunk (`mtu_bytes * packets_per_chunk`).
    pub chunk_bytes: usize,
    /// Data shards per stripe.
    pub k: u16,
    /// Parity shards per stripe.
    pub m: u16,
    /// Original data length.
    pub data_bytes: u64,
    /// Chunks carrying data.
    pub data_chunks: u32,
    /// Stripes (each contributes `m` parity chunks).
    pub stripes: u32,
    /// Chunks carrying parity.
    pub parity_chunks: u32,
}

impl EcGeometry {
    /// Compute the layout. Fails on zero chunking or a stripe wider than
    /// the GF(2^8) field allows.
    pub fn new(data_bytes: u64, chunk_bytes: usize, k: u16, m: u16) -> Result<Self> {
        if chunk_bytes == 0 {
            return Err(Error::InvalidConfig("zero chunk size"));
        }
        if k == 0 || m == 0 {
            return Err(Error::InvalidConfig("erasure coding needs k > 0 and m > 0"));
        }
        if usize::from(k) + usize::from(m) > 256 {
            return Err(Error::InvalidConfig("k + m exceeds the gf(2^8) field"));
        }
        let data_chunks =
            ((data_bytes + chunk_bytes as u64 - 1) / chunk_bytes as u64) as u32;
        let stripes = (data_chunks + u32::from(k) - 1) / u32::from(k);
        Ok(Self {
            chunk_bytes,
            k,
            m,
            data_bytes,
            data_chunks,
            stripes,
            parity_chunks: stripes * u32::from(m),
        })
    }

    /// Data plus parity chunks.
    pub fn total_chunks(&self) -> u32 {
        self.data_chunks + self.parity_chunks
    }

    /// Bytes on the wire: every chunk travels full-size.
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_chunks()) * self.chunk_bytes as u64
    }

    /// Global chunk index of parity shard `p` of `stripe`.
    pub fn parity_chunk(&self, stripe: u32, p: u16) -> u32 {
        self.data_chunks + stripe * u32::from(self.m) + u32::from(p)
    }

    /// Range of real data chunks covered by `stripe` (excludes zero-pad).
    fn stripe_data_range(&self, stripe: u32) -> std::ops::Range<u32> {
        let start = stripe * u32::from(self.k);
        start..(start + u32::from(self.k)).min(self.data_chunks)
    }
}

/// Sender-side erasure coding.
#[derive(Debug)]
pub struct EcSender {
    cfg: EcConfig,
    stats: EcStats,
}

impl EcSender {
    /// Create a sender controller.
    pub fn new(cfg: EcConfig) -> Self {
        Self {
            cfg,
            stats: EcStats::default(),
        }
    }

    /// Transfer counters.
    pub fn stats(&self) -> &EcStats {
        &self.stats
    }

    /// Encode `data` into a striped data+parity buffer, transmit it, and
    /// answer EC_NACK retransmit requests until the receiver acknowledges
    /// or requests SR fallback.
    pub fn run(&mut self, conn: &Connection, data: &[u8]) -> Result<()> {
        self.run_with_sink(conn, data, UdpSink::new)
    }

    /// Like [`run`](Self::run) with a custom sink factory, for loss
    /// injection in tests.
    pub fn run_with_sink<S, F>(&mut self, conn: &Connection, data: &[u8], make_sink: F) -> Result<()>
    where
        S: crate::sender::PacketSink,
        F: FnOnce(std::net::Ipv4Addr, u16) -> std::io::Result<S>,
    {
        let defaults = conn.params();
        let mtu = if defaults.mtu_bytes != 0 {
            defaults.mtu_bytes.min(MAX_PAYLOAD as u32)
        } else {
            MAX_PAYLOAD as u32
        };
        let ppc = if defaults.packets_per_chunk != 0 {
            defaults.packets_per_chunk
        } else {
            64
        };
        let chunk_bytes = mtu as usize * usize::from(ppc);
        let geo = EcGeometry::new(data.len() as u64, chunk_bytes, self.cfg.k, self.cfg.m)?;

        // Freeze the geometry the offer advertises so both sides agree on
        // chunk size.
        let mut offer_params = defaults;
        offer_params.mtu_bytes = mtu;
        offer_params.packet_bytes = mtu;
        offer_params.packets_per_chunk = ppc;
        offer_params.chunk_bytes = chunk_bytes as u32;
        conn.set_params(offer_params);

        let mut send_buf = vec![0u8; geo.total_bytes() as usize];
        send_buf[..data.len()].copy_from_slice(data);
        encode_parity(&geo, &mut send_buf)?;

        let ec = EcWire {
            fec_k: geo.k,
            fec_m: geo.m,
            data_chunks: geo.data_chunks,
        };
        let mut handle = conn.send_post_opts(&send_buf, Some(ec), self.cfg.sr.burst_pace(), make_sink)?;
        if handle.params().mtu_bytes != mtu || handle.params().packets_per_chunk != ppc {
            return Err(Error::InvalidConfig(
                "peer altered the chunk geometry mid-handshake",
            ));
        }
        self.stats.parity_sent += u64::from(geo.parity_chunks) * u64::from(ppc);
        info!(
            data_chunks = geo.data_chunks,
            parity_chunks = geo.parity_chunks,
            stripes = geo.stripes,
            "erasure-coded burst sent"
        );

        loop {
            let frame = conn.recv_control()?;
            match frame.control_type {
                ControlType::EcAck | ControlType::CompleteAck => return Ok(()),
                ControlType::IncompleteNack => return Err(Error::IncompleteTransfer),
                ControlType::EcNack => {
                    let mut resent = 0u64;
                    for (start, len) in frame.gaps() {
                        resent +=
                            handle.resend_chunks(&send_buf, start..start.saturating_add(len))?;
                    }
                    debug!(packets = resent, "answered ec nack");
                }
                ControlType::EcFallbackSr => {
                    self.stats.fallback_sr += 1;
                    info!("receiver requested sr fallback");
                    // The burst already happened once; a fresh post must not
                    // repeat it.
                    conn.set_auto_send(false);
                    let mut sr = SrSender::new(self.cfg.sr);
                    return sr.drive(conn, &mut handle, &send_buf);
                }
                other => debug!(got = ?other, "ignoring control message in ec sender"),
            }
        }
    }
}

/// Receiver-side erasure coding.
#[derive(Debug)]
pub struct EcReceiver {
    cfg: EcConfig,
    stats: EcStats,
}

impl EcReceiver {
    /// Create a receiver controller. `cfg.data_bytes` must hold the
    /// original data length.
    pub fn new(cfg: EcConfig) -> Self {
        Self {
            cfg,
            stats: EcStats::default(),
        }
    }

    /// Transfer counters.
    pub fn stats(&self) -> &EcStats {
        &self.stats
    }

    /// Receive one erasure-coded message. `buffer` must cover the data and
    /// parity regions ([`EcGeometry::total_bytes`]). Returns the decoded
    /// data, truncated to `data_bytes`.
    pub fn run(&mut self, conn: &Connection, buffer: Vec<u8>) -> Result<Vec<u8>> {
        let handle = conn.recv_post(buffer)?;
        let geo = match self.check_geometry(&handle) {
            Ok(geo) => geo,
            Err(e) => {
                let _ = handle.complete_as(false);
                return Err(e);
            }
        };

        let interval = Duration::from_millis(u64::from(self.cfg.sr.emission_interval_ms()));
        let progress_timeout = Duration::from_millis(self.cfg.progress_timeout_ms);
        let mut last_progress = Instant::now();
        let mut seen_chunks = handle.chunks().completed_count();
        let mut impossible_epochs = 0u32;

        loop {
            if handle.is_complete() {
                // Every chunk arrived; no decode needed.
                return self.finish_decoded(conn, handle, &geo, &[]);
            }
            handle.wait_progress(interval);

            let completed = handle.chunks().completed_count();
            if completed > seen_chunks {
                seen_chunks = completed;
                last_progress = Instant::now();
                // Fresh chunks arrived; failures are no longer consecutive.
                impossible_epochs = 0;
            }
            if last_progress.elapsed() >= progress_timeout {
                return handle.complete_as(false);
            }

            // Decode epoch.
            let present: Vec<bool> = (0..geo.total_chunks())
                .map(|c| handle.chunks().is_complete(c))
                .collect();
            let missing: Vec<u32> = (0..geo.data_chunks)
                .filter(|&c| !present[c as usize])
                .collect();
            if missing.is_empty() {
                return self.finish_decoded(conn, handle, &geo, &present);
            }
            if decode_feasible(&geo, &present) {
                self.stats.decode_success += 1;
                debug!(missing = missing.len(), "reconstructing missing data chunks");
                return self.finish_decoded(conn, handle, &geo, &present);
            }

            impossible_epochs += 1;
            if impossible_epochs > self.cfg.max_retries {
                self.stats.fallback_sr += 1;
                info!(
                    missing = missing.len(),
                    epochs = impossible_epochs,
                    "loss exceeds parity budget, falling back to sr"
                );
                conn.send_control(&ControlFrame::new(
                    ControlType::EcFallbackSr,
                    conn.connection_id(),
                ))?;
                let mut sr = SrReceiver::new(self.cfg.sr);
                let complete = sr.pump(conn, &handle)?;
                if !complete {
                    return handle.complete_as(false);
                }
                let mut data = handle.complete_as(true)?;
                data.truncate(geo.data_bytes as usize);
                return Ok(data);
            }
            self.emit_nack(conn, &missing)?;
        }
    }

    /// Derive the stripe geometry from the negotiated parameters and check
    /// it against the transfer size the sender offered.
    fn check_geometry(&self, handle: &RecvHandle<'_>) -> Result<EcGeometry> {
        let params = handle.params();
        let chunk_bytes = params.mtu_bytes as usize * usize::from(params.packets_per_chunk);
        let geo = EcGeometry::new(
            self.cfg.data_bytes,
            chunk_bytes,
            params.fec_k,
            params.fec_m,
        )?;
        if geo.total_bytes() != params.total_bytes {
            return Err(Error::InvalidConfig(
                "negotiated size does not match the erasure geometry",
            ));
        }
        Ok(geo)
    }

    /// Reclaim the buffer, reconstruct what is missing, and acknowledge.
    ///
    /// `present` may be empty when every chunk arrived.
    fn finish_decoded(
        &mut self,
        conn: &Connection,
        handle: RecvHandle<'_>,
        geo: &EcGeometry,
        present: &[bool],
    ) -> Result<Vec<u8>> {
        let (mut buf, _) = handle.finish_quiet();
        if !present.is_empty() {
            reconstruct(geo, &mut buf, present)?;
        }
        conn.send_control(&ControlFrame::new(ControlType::EcAck, conn.connection_id()))?;
        // The completion notification may race the sender tearing down.
        let _ = conn.send_control(&ControlFrame::new(
            ControlType::CompleteAck,
            conn.connection_id(),
        ));
        buf.truncate(geo.data_bytes as usize);
        Ok(buf)
    }

    /// Report runs of missing data chunks.
    fn emit_nack(&mut self, conn: &Connection, missing: &[u32]) -> Result<()> {
        let mut frame = ControlFrame::new(ControlType::EcNack, conn.connection_id());
        for (i, &(start, len)) in missing_runs(missing, GAP_SLOTS).iter().enumerate() {
            frame.push_gap(start, len);
            if i == 0 {
                frame.set_primary_gap(start, len);
            }
        }
        conn.send_control(&frame)
    }
}

/// Group a sorted list of missing chunk indices into `(start, len)` runs.
fn missing_runs(missing: &[u32], max_runs: usize) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut i = 0usize;
    while i < missing.len() && runs.len() < max_runs {
        let start = missing[i];
        let mut len = 1u32;
        while i + 1 < missing.len() && missing[i + 1] == missing[i] + 1 {
            i += 1;
            len += 1;
        }
        runs.push((start, len));
        i += 1;
    }
    runs
}

/// Whether every stripe with missing data holds at least `k` survivors.
fn decode_feasible(geo: &EcGeometry, present: &[bool]) -> bool {
    for stripe in 0..geo.stripes {
        let range = geo.stripe_data_range(stripe);
        let missing = range.clone().filter(|&c| !present[c as usize]).count();
        if missing == 0 {
            continue;
        }
        // Zero-pad shards count as survivors: they are known to be zero.
        let pad = usize::from(geo.k) - range.len();
        let present_data = range.len() - missing;
        let present_parity = (0..geo.m)
            .filter(|&p| present[geo.parity_chunk(stripe, p) as usize])
            .count();
        if present_data + pad + present_parity < usize::from(geo.k) {
            return false;
        }
    }
    true
}

/// Stripe-encode parity into the tail of `buf` (layout per [`EcGeometry`]).
pub(crate) fn encode_parity(geo: &EcGeometry, buf: &mut [u8]) -> Result<()> {
    if geo.stripes == 0 {
        return Ok(());
    }
    let rs = ReedSolomon::new(usize::from(geo.k), usize::from(geo.m))?;
    let cb = geo.chunk_bytes;
    let (data_region, parity_region) = buf.split_at_mut(geo.data_chunks as usize * cb);
    let zero = vec![0u8; cb];
    let mut parity: Vec<&mut [u8]> = parity_region.chunks_mut(cb).collect();

    for stripe in 0..geo.stripes {
        let mut data_refs: Vec<&[u8]> = Vec::with_capacity(usize::from(geo.k));
        for i in 0..u32::from(geo.k) {
            let chunk = stripe * u32::from(geo.k) + i;
            if chunk < geo.data_chunks {
                let at = chunk as usize * cb;
                data_refs.push(&data_region[at..at + cb]);
            } else {
                data_refs.push(&zero);
            }
        }
        let base = (stripe * u32::from(geo.m)) as usize;
        rs.encode_sep(&data_refs, &mut parity[base..base + usize::from(geo.m)])?;
    }
    Ok(())
}

/// Reconstruct every missing data chunk in `buf` from survivors.
///
/// `present[c]` says whether global chunk `c` was received. Requires each
/// stripe with missing data to hold at least `k` survivors.
pub(crate) fn reconstruct(geo: &EcGeometry, buf: &mut [u8], present: &[bool]) -> Result<()> {
    let rs = ReedSolomon::new(usize::from(geo.k), usize::from(geo.m))?;
    let cb = geo.chunk_bytes;

    for stripe in 0..geo.stripes {
        let range = geo.stripe_data_range(stripe);
        if range.clone().all(|c| present[c as usize]) {
            continue;
        }

        let mut shards: Vec<Option<Vec<u8>>> =
            Vec::with_capacity(usize::from(geo.k) + usize::from(geo.m));
        for i in 0..u32::from(geo.k) {
            let chunk = stripe * u32::from(geo.k) + i;
            if chunk >= geo.data_chunks {
                // Zero-pad shard: logically present, never transmitted.
                shards.push(Some(vec![0u8; cb]));
            } else if present[chunk as usize] {
                let at = chunk as usize * cb;
                shards.push(Some(buf[at..at + cb].to_vec()));
            } else {
                shards.push(None);
            }
        }
        for p in 0..geo.m {
            let chunk = geo.parity_chunk(stripe, p);
            if present[chunk as usize] {
                let at = chunk as usize * cb;
                shards.push(Some(buf[at..at + cb].to_vec()));
            } else {
                shards.push(None);
            }
        }

        rs.reconstruct_data(&mut shards)?;

        for i in 0..u32::from(geo.k) {
            let chunk = stripe * u32::from(geo.k) + i;
            if chunk < geo.data_chunks && !present[chunk as usize] {
                let shard = shards[i as usize]
                    .as_ref()
                    .expect("reconstruct_data fills data shards");
                let at = chunk as usize * cb;
                buf[at..at + cb].copy_from_slice(shard);
            }
        }
    }
    Ok(())
}
