//! # bulklink
//!
//! A reliable bulk-message transport built on unreliable UDP datagrams with a
//! small TCP side-channel used only for control.
//!
//! A transfer moves one large application buffer (megabytes to gigabytes) as a
//! single logical *message* from a sender to a receiver. Loss is tolerated by
//! one of two interchangeable reliability strategies:
//!
//! - **Selective Repeat (SR)**: cumulative ACK + bitmap + gap-hint NACKs
//!   drive chunk-granularity retransmission ([`reliability::SrSender`],
//!   [`reliability::SrReceiver`]).
//! - **Erasure Coding (EC)**: Reed-Solomon parity chunks let the receiver
//!   reconstruct losses without retransmission, falling back to SR when loss
//!   exceeds the parity budget ([`reliability::EcSender`],
//!   [`reliability::EcReceiver`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ sender                          receiver                    │
//! │  send_post ──OFFER──────────────▶ recv_post                 │
//! │            ◀────────────────CTS─                            │
//! │            ──ACCEPT─────────────▶                           │
//! │  DataPlane ══data/parity═══════▶ Backend ──▶ bitmaps        │
//! │    (N UDP channels, round-robin)   (N workers, callbacks)   │
//! │  SR/EC ctl ◀─SR_ACK/SR_NACK/...── SR/EC ctl                 │
//! │            ◀─COMPLETE_ACK───────                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The datagram path is oblivious to the reliability strategy: workers only
//! validate headers, write payload bytes, and set bits in a lock-free
//! two-level bitmap. Reliability controllers read bitmap state and talk over
//! the control stream.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulklink::{Context, Connection};
//! use bulklink::reliability::{SrConfig, SrReceiver, SrSender};
//!
//! // Receiver
//! let ctx = Context::new();
//! let conn = Connection::listen(&ctx, 7000)?;
//! let mut rx = SrReceiver::new(SrConfig::default());
//! let data = rx.run(&conn, vec![0u8; 1 << 20])?;
//!
//! // Sender
//! let ctx = Context::new();
//! let conn = Connection::connect(&ctx, "127.0.0.1", 7000)?;
//! let mut tx = SrSender::new(SrConfig::default());
//! tx.run(&conn, &data)?;
//! ```

pub mod api;
pub mod backend;
pub mod bitmap;
pub mod connection;
pub mod control;
pub mod message;
pub mod packet;
pub mod reliability;
pub mod sender;

pub use api::{Connection, Context, RecvHandle, SendHandle, StreamHandle};
pub use bitmap::{ProgressObserver, SetOutcome};
pub use control::{ControlType, WireParams};
pub use message::MessageState;
pub use packet::{PacketType, HEADER_LEN, MAX_PAYLOAD};

use std::io;

/// Number of addressable message IDs (10-bit space).
pub const MSG_ID_SPACE: usize = 1024;

/// Protocol magic, first two bytes of every packet header and control frame.
pub const MAGIC: u16 = 0x5344;

/// Errors surfaced to the caller.
///
/// Malformed, stale, and duplicate packets never surface here; they are
/// dropped on the datagram path and counted in [`backend::BackendCounters`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration or negotiated parameter is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Payload handed to the packet codec exceeds the datagram budget.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// All 1024 message slots are live.
    #[error("message id space exhausted")]
    ResourceExhausted,

    /// The peer refused the offered parameters.
    #[error("handshake rejected by peer")]
    HandshakeRejected,

    /// The expected control message never arrived before the stream closed.
    #[error("handshake desynchronized: expected {expected}")]
    HandshakeDesync { expected: &'static str },

    /// The receiver reported the transfer incomplete, or progress stalled
    /// past the configured timeout.
    #[error("transfer incomplete")]
    IncompleteTransfer,

    /// The control stream broke underneath an active transfer.
    #[error("control transport lost")]
    TransportLost(#[source] io::Error),

    /// Erasure-coding parameters were rejected by the codec.
    #[error("erasure coding error")]
    Fec(#[from] reed_solomon_erasure::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::TransportLost(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
