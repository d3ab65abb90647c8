//! Message slots and the 10-bit message-id allocator.
//!
//! A [`MessageSlot`] owns one in-flight message: its receive buffer, both
//! bitmaps, and the frozen geometry. Datagram workers hold an `Arc` to the
//! slot and write payload bytes through an atomic target pointer; completing
//! the message redirects that pointer to the connection's null sink and
//! drains in-flight writers before the backing buffer is handed back, so a
//! late packet can never touch user memory.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::bitmap::{ChunkBitmap, PacketBitmap};
use crate::control::WireParams;
use crate::{Error, Result, MSG_ID_SPACE};

/// Lifecycle state of a message slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageState {
    /// Slot not in use.
    Null = 0,
    /// Receiving packets into user memory.
    Active = 1,
    /// All chunks complete; packets are no longer accepted.
    Completed = 2,
    /// Completion processed; buffer redirected to the null sink.
    Dead = 3,
}

impl MessageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Completed,
            3 => Self::Dead,
            _ => Self::Null,
        }
    }
}

/// One in-flight message.
#[derive(Debug)]
pub struct MessageSlot {
    msg_id: u16,
    generation: u32,
    state: AtomicU8,
    /// Payload write target; points into the backing buffer while ACTIVE,
    /// at the null sink once DEAD.
    target: AtomicPtr<u8>,
    target_len: AtomicUsize,
    /// In-flight payload writers, drained before the buffer is released.
    writers: AtomicU32,
    backing: Mutex<Option<Box<[u8]>>>,
    /// Packet-granularity backend bitmap.
    pub packets: PacketBitmap,
    /// Chunk-granularity frontend bitmap.
    pub chunks: ChunkBitmap,
    mtu_bytes: u32,
    params: WireParams,
}

impl MessageSlot {
    /// Create an ACTIVE slot owning `buffer`.
    pub fn new(
        msg_id: u16,
        generation: u32,
        mut buffer: Box<[u8]>,
        total_packets: u32,
        total_chunks: u32,
        params: WireParams,
    ) -> Self {
        let target = buffer.as_mut_ptr();
        let target_len = buffer.len();
        Self {
            msg_id,
            generation,
            state: AtomicU8::new(MessageState::Active as u8),
            target: AtomicPtr::new(target),
            target_len: AtomicUsize::new(target_len),
            writers: AtomicU32::new(0),
            backing: Mutex::new(Some(buffer)),
            packets: PacketBitmap::new(total_packets, params.packets_per_chunk),
            chunks: ChunkBitmap::new(total_chunks),
            mtu_bytes: params.mtu_bytes,
            params,
        }
    }

    /// Message id this slot was allocated under.
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Generation stamped at allocation; datagrams carrying any other
    /// `transfer_id` are discarded.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the slot still accepts packets.
    pub fn is_active(&self) -> bool {
        self.state() == MessageState::Active
    }

    /// Negotiated parameters frozen for this message.
    pub fn params(&self) -> &WireParams {
        &self.params
    }

    /// Total packets in the message.
    pub fn total_packets(&self) -> u32 {
        self.packets.total_packets()
    }

    /// Total chunks in the message.
    pub fn total_chunks(&self) -> u32 {
        self.chunks.total_chunks()
    }

    /// ACTIVE → COMPLETED, once every chunk has been observed complete.
    pub fn mark_completed(&self) {
        let _ = self.state.compare_exchange(
            MessageState::Active as u8,
            MessageState::Completed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Copy `payload` into the message buffer at `packet_offset`'s region,
    /// clamped to the buffer length (the trailing packet may be short).
    ///
    /// The caller must have won the packet's claim bit; that claim is what
    /// makes concurrent writers target disjoint regions. Returns `false`
    /// when the slot no longer accepts writes.
    pub fn write_payload(&self, packet_offset: u32, payload: &[u8]) -> bool {
        self.writers.fetch_add(1, Ordering::AcqRel);
        let wrote = self.write_payload_inner(packet_offset, payload);
        self.writers.fetch_sub(1, Ordering::AcqRel);
        wrote
    }

    fn write_payload_inner(&self, packet_offset: u32, payload: &[u8]) -> bool {
        if self.state.load(Ordering::Acquire) != MessageState::Active as u8 {
            return false;
        }
        let base = self.target.load(Ordering::Acquire);
        let len = self.target_len.load(Ordering::Acquire);
        let offset = packet_offset as usize * self.mtu_bytes as usize;
        if offset >= len {
            return false;
        }
        let n = payload.len().min(len - offset);
        // The claim bit grants exclusive ownership of this packet's region,
        // and `complete` drains `writers` before releasing the backing
        // buffer, so `base + offset .. base + offset + n` stays valid and
        // unaliased for the duration of the copy.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), base.add(offset), n);
        }
        true
    }

    /// Transition to DEAD, redirect the write target at the null sink, and
    /// reclaim the backing buffer once in-flight writers have drained.
    ///
    /// Returns `None` if the buffer was already taken.
    pub fn complete(&self, null_sink: *mut u8) -> Option<Box<[u8]>> {
        self.state
            .store(MessageState::Dead as u8, Ordering::Release);
        self.target.store(null_sink, Ordering::Release);
        self.target_len.store(0, Ordering::Release);
        while self.writers.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        self.backing.lock().expect("slot backing poisoned").take()
    }
}

/// Allocates message ids from the 10-bit space with rotating generations.
///
/// Generations come from a single monotonically increasing counter stamped
/// at allocation time, so reusing an id always yields a strictly greater
/// generation than every previous occupant of that id, even when the
/// cursor never wraps.
#[derive(Debug)]
pub struct MsgIdAllocator {
    inner: Mutex<AllocInner>,
}

#[derive(Debug)]
struct AllocInner {
    in_use: Box<[bool]>,
    generations: Box<[u32]>,
    cursor: usize,
    next_generation: u32,
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgIdAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocInner {
                in_use: vec![false; MSG_ID_SPACE].into_boxed_slice(),
                generations: vec![0; MSG_ID_SPACE].into_boxed_slice(),
                cursor: 0,
                next_generation: 1,
            }),
        }
    }

    /// Allocate the next free id, returning `(msg_id, generation)`.
    ///
    /// The stamped generation is strictly greater than both every
    /// generation handed out so far and the id's recorded floor, so a
    /// reused id never repeats a generation even after
    /// [`bump_generation`](Self::bump_generation) has pushed it ahead of
    /// the global counter.
    ///
    /// Fails with [`Error::ResourceExhausted`] when all 1024 slots are live;
    /// callers must surface this without blocking.
    pub fn allocate(&self) -> Result<(u16, u32)> {
        let mut inner = self.inner.lock().expect("allocator poisoned");
        let start = inner.cursor;
        loop {
            let id = inner.cursor;
            inner.cursor = (inner.cursor + 1) % MSG_ID_SPACE;
            if !inner.in_use[id] {
                // The recorded generation is a floor; completion processing
                // may have bumped this id past the global counter.
                let generation = inner.next_generation.max(inner.generations[id] + 1);
                inner.next_generation = generation + 1;
                inner.in_use[id] = true;
                inner.generations[id] = generation;
                return Ok((id as u16, generation));
            }
            if inner.cursor == start {
                return Err(Error::ResourceExhausted);
            }
        }
    }

    /// Release an id for reuse. Its generation stays recorded so the next
    /// occupant is stamped strictly greater.
    pub fn free(&self, msg_id: u16) {
        let id = usize::from(msg_id);
        if id >= MSG_ID_SPACE {
            return;
        }
        let mut inner = self.inner.lock().expect("allocator poisoned");
        inner.in_use[id] = false;
    }

    /// Record completion processing for an id: raise its generation floor
    /// so the next occupant of this id is stamped strictly past the
    /// finished transfer.
    pub fn bump_generation(&self, msg_id: u16) {
        let id = usize::from(msg_id);
        if id >= MSG_ID_SPACE {
            return;
        }
        let mut inner = self.inner.lock().expect("allocator poisoned");
        inner.generations[id] += 1;
    }

    /// Stable read of an id's generation.
    pub fn generation(&self, msg_id: u16) -> u32 {
        let id = usize::from(msg_id);
        if id >= MSG_ID_SPACE {
            return 0;
        }
        self.inner.lock().expect("allocator poisoned").generations[id]
    }
}
