//! Reliability controllers.
//!
//! Two interchangeable strategies sit on top of the handshake and datagram
//! plane:
//!
//! - **Selective Repeat** ([`SrSender`] / [`SrReceiver`]): the receiver
//!   reports cumulative progress, a chunk bitmap window, and gap hints; the
//!   sender retransmits chunks on NACKs and on RTO expiry.
//! - **Erasure Coding** ([`EcSender`] / [`EcReceiver`]): the sender stripes
//!   Reed-Solomon parity over the data; the receiver reconstructs losses
//!   locally and only falls back to SR when loss exceeds the parity budget.
//!
//! The choice is per-message configuration. The datagram path is identical
//! under both: workers write bits and payload, controllers read bitmaps and
//! emit control records.

mod ec;
mod sr;

pub use ec::{EcGeometry, EcReceiver, EcSender};
pub use sr::{SrReceiver, SrSender};

/// Selective-repeat tuning.
#[derive(Debug, Clone, Copy)]
pub struct SrConfig {
    /// Fixed retransmission timeout; zero derives it from
    /// `base_rtt_ms + alpha_ms`.
    pub rto_ms: u32,
    /// Estimated round-trip time.
    pub base_rtt_ms: u32,
    /// RTT margin added on top of the estimate.
    pub alpha_ms: u32,
    /// Minimum interval between receiver control emissions; clamped up to
    /// 100 ms.
    pub nack_delay_ms: u32,
    /// Guard interval preventing re-retransmission of the same chunk within
    /// one RTT.
    pub guard_ms: u32,
    /// Cap on chunks retransmitted per RTO sweep; zero means unlimited.
    pub max_inflight_chunks: u16,
    /// Receiver gives up after this long without a newly completed chunk.
    pub progress_timeout_ms: u64,
    /// Fixed inter-packet delay during the initial burst, in microseconds;
    /// zero sends at line rate.
    pub burst_pace_micros: u32,
}

impl Default for SrConfig {
    fn default() -> Self {
        Self {
            rto_ms: 0,
            base_rtt_ms: 100,
            alpha_ms: 100,
            nack_delay_ms: 100,
            guard_ms: 50,
            max_inflight_chunks: 0,
            progress_timeout_ms: 30_000,
            burst_pace_micros: 0,
        }
    }
}

impl SrConfig {
    /// Tuning for low-latency local links: tight timers, fast emission, a
    /// light burst pace so loopback socket buffers keep up.
    pub fn low_latency() -> Self {
        Self {
            rto_ms: 40,
            base_rtt_ms: 10,
            alpha_ms: 10,
            nack_delay_ms: 10,
            guard_ms: 10,
            burst_pace_micros: 20,
            ..Self::default()
        }
    }

    /// Burst pacing as a `Duration`, when configured.
    pub fn burst_pace(&self) -> Option<std::time::Duration> {
        if self.burst_pace_micros == 0 {
            None
        } else {
            Some(std::time::Duration::from_micros(u64::from(
                self.burst_pace_micros,
            )))
        }
    }

    /// Effective retransmission timeout in milliseconds.
    pub fn effective_rto_ms(&self) -> u32 {
        if self.rto_ms != 0 {
            self.rto_ms
        } else {
            self.base_rtt_ms + self.alpha_ms
        }
    }

    /// Minimum interval between receiver control emissions.
    pub fn emission_interval_ms(&self) -> u32 {
        self.nack_delay_ms.max(100)
    }
}

/// Selective-repeat counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrStats {
    /// SR_ACK frames emitted (receiver).
    pub acks_sent: u64,
    /// SR_NACK frames emitted (receiver).
    pub nacks_sent: u64,
    /// Chunks retransmitted (sender).
    pub retransmits: u64,
}

/// Erasure-coding tuning.
#[derive(Debug, Clone, Copy)]
pub struct EcConfig {
    /// Data chunks per stripe.
    pub k: u16,
    /// Parity chunks per stripe.
    pub m: u16,
    /// Original data length, excluding parity. The receiver needs this to
    /// recover the stripe geometry; the sender derives it from the posted
    /// buffer.
    pub data_bytes: u64,
    /// Consecutive impossible decode epochs tolerated before the receiver
    /// requests SR fallback.
    pub max_retries: u32,
    /// Receiver gives up after this long without a newly completed chunk.
    pub progress_timeout_ms: u64,
    /// Tuning for the nested SR session after fallback.
    pub sr: SrConfig,
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            data_bytes: 0,
            max_retries: 3,
            progress_timeout_ms: 30_000,
            sr: SrConfig::default(),
        }
    }
}

/// Erasure-coding counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcStats {
    /// Parity packets pushed in the initial burst (sender).
    pub parity_sent: u64,
    /// Successful stripe reconstructions (receiver).
    pub decode_success: u64,
    /// Transfers that fell back to SR.
    pub fallback_sr: u64,
}
