//! Two-level atomic bitmap engine.
//!
//! The *packet bitmap* is written by datagram workers: one bit per packet,
//! stored as 64-bit atomic words. A worker must first *claim* a packet (an
//! atomic test-and-set that grants exclusive ownership of the packet's
//! buffer region), copy the payload, then *publish* the bit with a release
//! store. Chunk-completion checks pair acquire loads against that release,
//! so a complete chunk implies its payload bytes are visible.
//!
//! The *chunk bitmap* is derived: the first worker to observe a chunk's
//! packet range fully published promotes the chunk bit with a test-and-set,
//! which is what makes `on_chunk_complete` fire exactly once.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Result of recording a packet in the bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The bit was newly set; the caller owns the payload write.
    NewlySet,
    /// The bit was already set; skip the payload write.
    Duplicate,
    /// The offset lies outside the message.
    OutOfRange,
}

/// Progress callbacks fired from datagram workers.
///
/// All methods may be invoked concurrently. `on_chunk_complete` and
/// `on_message_complete` fire at most once per chunk / message.
pub trait ProgressObserver: Send + Sync {
    /// Veto hook consulted before a packet is recorded. Returning `false`
    /// drops the packet without touching buffer or bitmap.
    fn on_packet(&self, _msg_id: u16, _packet_offset: u32) -> bool {
        true
    }

    /// A chunk's packet range was observed fully received.
    fn on_chunk_complete(&self, _msg_id: u16, _chunk_id: u32) {}

    /// Every chunk of the message is complete.
    fn on_message_complete(&self, _msg_id: u16) {}
}

/// No-op observer.
impl ProgressObserver for () {}

/// Packet-granularity atomic bitmap (the backend bitmap).
#[derive(Debug)]
pub struct PacketBitmap {
    /// Write-ownership bits; won before the payload copy.
    claim: Box<[AtomicU64]>,
    /// Published bits; set after the payload copy, read with acquire.
    seen: Box<[AtomicU64]>,
    total_packets: u32,
    packets_per_chunk: u16,
}

impl PacketBitmap {
    /// Create a bitmap for `total_packets` packets grouped by
    /// `packets_per_chunk`.
    pub fn new(total_packets: u32, packets_per_chunk: u16) -> Self {
        let words = (total_packets as usize + 63) / 64;
        Self {
            claim: (0..words).map(|_| AtomicU64::new(0)).collect(),
            seen: (0..words).map(|_| AtomicU64::new(0)).collect(),
            total_packets,
            packets_per_chunk,
        }
    }

    /// Total packets tracked.
    pub fn total_packets(&self) -> u32 {
        self.total_packets
    }

    /// Negotiated chunk width.
    pub fn packets_per_chunk(&self) -> u16 {
        self.packets_per_chunk
    }

    /// Total chunks tracked.
    pub fn total_chunks(&self) -> u32 {
        if self.packets_per_chunk == 0 {
            return 0;
        }
        (self.total_packets + u32::from(self.packets_per_chunk) - 1)
            / u32::from(self.packets_per_chunk)
    }

    /// Win write ownership of a packet's buffer region.
    ///
    /// Exactly one caller per offset observes [`SetOutcome::NewlySet`]; it
    /// must copy the payload and then [`publish`](Self::publish).
    pub fn claim(&self, packet_offset: u32) -> SetOutcome {
        if packet_offset >= self.total_packets {
            return SetOutcome::OutOfRange;
        }
        let (word, mask) = word_mask(packet_offset);
        let old = self.claim[word].fetch_or(mask, Ordering::AcqRel);
        if old & mask == 0 {
            SetOutcome::NewlySet
        } else {
            SetOutcome::Duplicate
        }
    }

    /// Publish a claimed packet: release-store the bit so chunk-completion
    /// readers observe the payload bytes written before it.
    pub fn publish(&self, packet_offset: u32) {
        debug_assert!(packet_offset < self.total_packets);
        let (word, mask) = word_mask(packet_offset);
        self.seen[word].fetch_or(mask, Ordering::Release);
    }

    /// Claim and publish in one step, for packets with no payload to copy.
    pub fn set_packet(&self, packet_offset: u32) -> SetOutcome {
        let outcome = self.claim(packet_offset);
        if outcome == SetOutcome::NewlySet {
            self.publish(packet_offset);
        }
        outcome
    }

    /// Whether a packet has been published.
    pub fn is_packet(&self, packet_offset: u32) -> bool {
        if packet_offset >= self.total_packets {
            return false;
        }
        let (word, mask) = word_mask(packet_offset);
        self.seen[word].load(Ordering::Acquire) & mask != 0
    }

    /// Whether every packet of `chunk_id` has been published.
    ///
    /// Performs a bounded sequence of word loads: a partial mask for the
    /// first word, `!0` comparisons for the middle words, and a partial mask
    /// for the last word. No per-bit scanning.
    pub fn is_chunk_complete(&self, chunk_id: u32) -> bool {
        if self.packets_per_chunk == 0 || chunk_id >= self.total_chunks() {
            return false;
        }
        let start = chunk_id * u32::from(self.packets_per_chunk);
        let end = (start + u32::from(self.packets_per_chunk)).min(self.total_packets);

        let start_word = (start / 64) as usize;
        let start_bit = start % 64;
        let end_word = ((end - 1) / 64) as usize;
        let end_bit = (end - 1) % 64 + 1;

        if start_word == end_word {
            let mask = span_mask(start_bit, end_bit);
            return self.seen[start_word].load(Ordering::Acquire) & mask == mask;
        }

        let first_mask = span_mask(start_bit, 64);
        if self.seen[start_word].load(Ordering::Acquire) & first_mask != first_mask {
            return false;
        }
        for word in start_word + 1..end_word {
            if self.seen[word].load(Ordering::Acquire) != u64::MAX {
                return false;
            }
        }
        let last_mask = span_mask(0, end_bit);
        self.seen[end_word].load(Ordering::Acquire) & last_mask == last_mask
    }

    /// Count of published packets.
    pub fn received_count(&self) -> u32 {
        self.seen
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }
}

/// Chunk-granularity bitmap (the frontend bitmap), promoted from the packet
/// bitmap by the datagram workers.
#[derive(Debug)]
pub struct ChunkBitmap {
    words: Box<[AtomicU64]>,
    total_chunks: u32,
    completed: AtomicU32,
}

impl ChunkBitmap {
    /// Create a bitmap for `total_chunks` chunks.
    pub fn new(total_chunks: u32) -> Self {
        let words = (total_chunks as usize + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            total_chunks,
            completed: AtomicU32::new(0),
        }
    }

    /// Total chunks tracked.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Mark a chunk complete. Returns `Some(new_completed_count)` for the
    /// single caller that actually flipped the bit; that caller fires
    /// `on_chunk_complete`, and fires `on_message_complete` when the count
    /// it receives equals the total.
    pub fn mark_complete(&self, chunk_id: u32) -> Option<u32> {
        if chunk_id >= self.total_chunks {
            return None;
        }
        let (word, mask) = word_mask(chunk_id);
        let old = self.words[word].fetch_or(mask, Ordering::AcqRel);
        if old & mask == 0 {
            Some(self.completed.fetch_add(1, Ordering::AcqRel) + 1)
        } else {
            None
        }
    }

    /// Whether a chunk has been marked complete.
    pub fn is_complete(&self, chunk_id: u32) -> bool {
        if chunk_id >= self.total_chunks {
            return false;
        }
        let (word, mask) = word_mask(chunk_id);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Number of chunks marked complete.
    pub fn completed_count(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether every chunk is complete.
    pub fn is_all_complete(&self) -> bool {
        self.completed_count() >= self.total_chunks
    }

    /// Highest chunk index `c` such that chunks `0..=c` are all complete.
    pub fn cumulative(&self) -> Option<u32> {
        let mut run: u32 = 0;
        for word in self.words.iter() {
            let value = word.load(Ordering::Acquire);
            run += value.trailing_ones();
            if value != u64::MAX {
                break;
            }
        }
        run = run.min(self.total_chunks);
        run.checked_sub(1)
    }

    /// Copy up to `out.len()` words of the bitmap into `out`, returning the
    /// number of meaningful words.
    pub fn snapshot_into(&self, out: &mut [u64]) -> usize {
        let n = out.len().min(self.words.len());
        for (dst, src) in out.iter_mut().zip(self.words.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        n
    }

    /// Full snapshot of the bitmap words.
    pub fn snapshot(&self) -> Vec<u64> {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect()
    }
}

#[inline]
fn word_mask(index: u32) -> (usize, u64) {
    ((index / 64) as usize, 1u64 << (index % 64))
}

/// Mask with bits `[start, end)` set, `end <= 64`.
#[inline]
fn span_mask(start: u32, end: u32) -> u64 {
    debug_assert!(start < end && end <= 64);
    let high = if end == 64 {
        u64::MAX
    } else {
        (1u64 << end) - 1
    };
    high & !((1u64 << start) - 1)
}
