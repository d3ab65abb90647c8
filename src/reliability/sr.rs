//! Selective-repeat controllers.
//!
//! The sender owns `chunk_acked` / `last_tx` vectors and is driven by three
//! interleaved activities: the initial burst (already done by `send_post`),
//! control-driven retransmission on SR_ACK / SR_NACK, and RTO-driven
//! retransmission when the control channel stays silent. The receiver wires
//! the bitmap engine's callbacks into a rate-limited control emission loop.

use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::api::{Connection, RecvHandle, SendHandle};
use crate::bitmap::ChunkBitmap;
use crate::control::{ControlFrame, ControlType, BITMAP_WORDS};
use crate::sender::PacketSink;
use crate::{Error, Result};

use super::{SrConfig, SrStats};

/// Chunks retransmitted per SR_ACK (guard-gated opportunistic resend).
const ACK_RETRANSMIT_BUDGET: usize = 4;

/// Chunks retransmitted per SR_NACK.
const NACK_RETRANSMIT_BUDGET: usize = 8;

/// Gap runs reported per control frame.
const MAX_GAP_RUNS: usize = 4;

/// Bitmap words snapshotted into a control frame.
const SNAPSHOT_WORDS: usize = 8;

/// Sender-side selective repeat.
#[derive(Debug)]
pub struct SrSender {
    cfg: SrConfig,
    stats: SrStats,
}

impl SrSender {
    /// Create a sender controller.
    pub fn new(cfg: SrConfig) -> Self {
        Self {
            cfg,
            stats: SrStats::default(),
        }
    }

    /// Transfer counters.
    pub fn stats(&self) -> &SrStats {
        &self.stats
    }

    /// Send `data` reliably: handshake, initial burst, then retransmit
    /// until COMPLETE_ACK or INCOMPLETE_NACK.
    pub fn run(&mut self, conn: &Connection, data: &[u8]) -> Result<()> {
        self.run_with_sink(conn, data, crate::sender::UdpSink::new)
    }

    /// Like [`run`](Self::run) with a custom sink factory, for loss
    /// injection in tests.
    pub fn run_with_sink<S, F>(&mut self, conn: &Connection, data: &[u8], make_sink: F) -> Result<()>
    where
        S: PacketSink,
        F: FnOnce(Ipv4Addr, u16) -> io::Result<S>,
    {
        let pace = self.cfg.burst_pace();
        let mut handle = conn.send_post_opts(data, None, pace, make_sink)?;
        self.drive(conn, &mut handle, data)
    }

    /// Drive an already-posted send to completion. The EC fallback path
    /// enters here with its encoded buffer.
    pub(crate) fn drive<S: PacketSink>(
        &mut self,
        conn: &Connection,
        handle: &mut SendHandle<'_, S>,
        data: &[u8],
    ) -> Result<()> {
        let total_chunks = handle.params().total_chunks as usize;
        let mut acked = vec![false; total_chunks];
        let mut last_tx = vec![Instant::now(); total_chunks];
        let rto = Duration::from_millis(u64::from(self.cfg.effective_rto_ms()));
        let guard = Duration::from_millis(u64::from(self.cfg.guard_ms));

        loop {
            match conn.recv_control_timeout(rto)? {
                Some(frame) => match frame.control_type {
                    ControlType::SrAck => {
                        absorb_ack(&frame, &mut acked);
                        let now = Instant::now();
                        let picks: Vec<u32> = (0..total_chunks)
                            .filter(|&c| !acked[c] && now.duration_since(last_tx[c]) >= guard)
                            .take(ACK_RETRANSMIT_BUDGET)
                            .map(|c| c as u32)
                            .collect();
                        self.retransmit(handle, data, &picks, &mut last_tx)?;
                    }
                    ControlType::SrNack => {
                        absorb_ack(&frame, &mut acked);
                        let now = Instant::now();
                        let mut picks = Vec::new();
                        'gaps: for (start, len) in frame.gaps() {
                            for c in start..start.saturating_add(len) {
                                if picks.len() >= NACK_RETRANSMIT_BUDGET {
                                    break 'gaps;
                                }
                                let i = c as usize;
                                if i < total_chunks
                                    && !acked[i]
                                    && now.duration_since(last_tx[i]) >= guard
                                {
                                    picks.push(c);
                                }
                            }
                        }
                        self.retransmit(handle, data, &picks, &mut last_tx)?;
                    }
                    ControlType::CompleteAck | ControlType::EcAck => return Ok(()),
                    ControlType::IncompleteNack => return Err(Error::IncompleteTransfer),
                    other => debug!(got = ?other, "ignoring control message in sr sender"),
                },
                None => {
                    // Control silence: sweep for chunks past their RTO.
                    let now = Instant::now();
                    let mut picks: Vec<u32> = (0..total_chunks)
                        .filter(|&c| !acked[c] && now.duration_since(last_tx[c]) >= rto)
                        .map(|c| c as u32)
                        .collect();
                    if self.cfg.max_inflight_chunks != 0 {
                        picks.truncate(usize::from(self.cfg.max_inflight_chunks));
                    }
                    self.retransmit(handle, data, &picks, &mut last_tx)?;
                }
            }
        }
    }

    fn retransmit<S: PacketSink>(
        &mut self,
        handle: &mut SendHandle<'_, S>,
        data: &[u8],
        chunks: &[u32],
        last_tx: &mut [Instant],
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        trace!(?chunks, "retransmitting");
        handle.resend_chunks(data, chunks.iter().copied())?;
        let now = Instant::now();
        for &c in chunks {
            last_tx[c as usize] = now;
        }
        self.stats.retransmits += chunks.len() as u64;
        Ok(())
    }
}

/// Fold a frame's cumulative index and bitmap window into the acked vector.
fn absorb_ack(frame: &ControlFrame, acked: &mut [bool]) {
    if let Some(cumulative) = frame.cumulative_chunk() {
        let end = (cumulative as usize + 1).min(acked.len());
        for slot in &mut acked[..end] {
            *slot = true;
        }
    }
    let words = usize::from(frame.bitmap_words).min(BITMAP_WORDS);
    for (w, &word) in frame.chunk_bitmap[..words].iter().enumerate() {
        if word == 0 {
            continue;
        }
        for bit in 0..64 {
            if word & (1 << bit) != 0 {
                let chunk = w * 64 + bit;
                if chunk < acked.len() {
                    acked[chunk] = true;
                }
            }
        }
    }
}

/// Receiver-side selective repeat.
#[derive(Debug)]
pub struct SrReceiver {
    cfg: SrConfig,
    stats: SrStats,
}

impl SrReceiver {
    /// Create a receiver controller.
    pub fn new(cfg: SrConfig) -> Self {
        Self {
            cfg,
            stats: SrStats::default(),
        }
    }

    /// Transfer counters.
    pub fn stats(&self) -> &SrStats {
        &self.stats
    }

    /// Receive one message into `buffer`: handshake, pump acknowledgments
    /// until complete, then COMPLETE_ACK. Returns the filled buffer.
    pub fn run(&mut self, conn: &Connection, buffer: Vec<u8>) -> Result<Vec<u8>> {
        let handle = conn.recv_post(buffer)?;
        let complete = self.pump(conn, &handle)?;
        handle.complete_as(complete)
    }

    /// Emission loop shared with the EC fallback path. Returns whether the
    /// transfer completed before the progress timeout.
    pub(crate) fn pump(&mut self, conn: &Connection, handle: &RecvHandle<'_>) -> Result<bool> {
        let interval = Duration::from_millis(u64::from(self.cfg.emission_interval_ms()));
        let progress_timeout = Duration::from_millis(self.cfg.progress_timeout_ms);
        let mut last_emit = Instant::now();
        let mut last_progress = Instant::now();
        let mut seen_chunks = handle.chunks().completed_count();

        loop {
            if handle.is_complete() {
                return Ok(true);
            }
            handle.wait_progress(interval);

            let completed = handle.chunks().completed_count();
            if completed > seen_chunks {
                seen_chunks = completed;
                last_progress = Instant::now();
            }
            if handle.is_complete() {
                return Ok(true);
            }
            if last_progress.elapsed() >= progress_timeout {
                debug!("no progress within timeout, giving up");
                return Ok(false);
            }
            if last_emit.elapsed() >= interval {
                self.emit(conn, handle)?;
                last_emit = Instant::now();
            }
        }
    }

    /// Emit one SR_ACK or SR_NACK describing current progress.
    fn emit(&mut self, conn: &Connection, handle: &RecvHandle<'_>) -> Result<()> {
        let chunks = handle.chunks();
        let mut frame = ControlFrame::new(ControlType::SrAck, conn.connection_id());
        frame.params.total_chunks = chunks.total_chunks();

        let cumulative = chunks.cumulative();
        frame.set_cumulative_chunk(cumulative);

        let mut words = [0u64; SNAPSHOT_WORDS];
        let filled = chunks.snapshot_into(&mut words);
        frame.chunk_bitmap[..filled].copy_from_slice(&words[..filled]);
        frame.bitmap_words = filled as u16;

        let from = cumulative.map_or(0, |c| c + 1);
        let gaps = collect_gaps(chunks, from, MAX_GAP_RUNS);
        if gaps.is_empty() {
            self.stats.acks_sent += 1;
        } else {
            frame.control_type = ControlType::SrNack;
            frame.set_primary_gap(gaps[0].0, gaps[0].1);
            for &(start, len) in &gaps {
                frame.push_gap(start, len);
            }
            self.stats.nacks_sent += 1;
        }
        conn.send_control(&frame)
    }
}

/// Collect up to `max_runs` runs of missing chunks starting at `from`.
fn collect_gaps(chunks: &ChunkBitmap, from: u32, max_runs: usize) -> Vec<(u32, u32)> {
    let total = chunks.total_chunks();
    let mut gaps = Vec::new();
    let mut c = from;
    while c < total && gaps.len() < max_runs {
        if chunks.is_complete(c) {
            c += 1;
            continue;
        }
        let start = c;
        while c < total && !chunks.is_complete(c) {
            c += 1;
        }
        gaps.push((start, c - start));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_cumulative() {
        let mut frame = ControlFrame::new(ControlType::SrAck, 0);
        frame.set_cumulative_chunk(Some(2));
        let mut acked = vec![false; 6];
        absorb_ack(&frame, &mut acked);
        assert_eq!(acked, vec![true, true, true, false, false, false]);
    }

    #[test]
    fn test_absorb_bitmap_window() {
        let mut frame = ControlFrame::new(ControlType::SrAck, 0);
        frame.bitmap_words = 2;
        frame.chunk_bitmap[0] = 0b1010;
        frame.chunk_bitmap[1] = 0b1;
        let mut acked = vec![false; 70];
        absorb_ack(&frame, &mut acked);
        assert!(acked[1]);
        assert!(acked[3]);
        assert!(acked[64]);
        assert!(!acked[0]);
        assert_eq!(acked.iter().filter(|&&a| a).count(), 3);
    }

    #[test]
    fn test_absorb_ignores_out_of_range() {
        let mut frame = ControlFrame::new(ControlType::SrAck, 0);
        frame.set_cumulative_chunk(Some(100));
        frame.bitmap_words = 1;
        frame.chunk_bitmap[0] = u64::MAX;
        let mut acked = vec![false; 3];
        absorb_ack(&frame, &mut acked);
        assert_eq!(acked, vec![true, true, true]);
    }

    #[test]
    fn test_collect_gaps() {
        let chunks = ChunkBitmap::new(10);
        for c in [0u32, 1, 4, 5, 8] {
            let _ = chunks.mark_complete(c);
        }
        // Missing: 2-3, 6-7, 9.
        let gaps = collect_gaps(&chunks, 2, 4);
        assert_eq!(gaps, vec![(2, 2), (6, 2), (9, 1)]);

        let capped = collect_gaps(&chunks, 0, 2);
        assert_eq!(capped, vec![(2, 2), (6, 2)]);
    }

    #[test]
    fn test_collect_gaps_none_missing() {
        let chunks = ChunkBitmap::new(4);
        for c in 0..4 {
            let _ = chunks.mark_complete(c);
        }
        assert!(collect_gaps(&chunks, 0, 4).is_empty());
    }
}
