//! Per-connection state: the message table and the null sink.
//!
//! The table maps the 10-bit message-id space to live [`MessageSlot`]s. It
//! is mutex-guarded for allocate/get/complete; the datagram hot path clones
//! an `Arc` out once per packet and never holds the lock across a payload
//! write.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};

use crate::control::WireParams;
use crate::message::{MessageSlot, MessageState};
use crate::{Error, Result, MSG_ID_SPACE};

/// Shared one-byte region that dead slots' buffer pointers are redirected
/// to, so a late packet's write step resolves against valid, ignorable
/// memory.
#[derive(Debug)]
pub struct NullSink {
    byte: Box<UnsafeCell<u8>>,
}

// The sink is only ever a redirect target; its length is published as zero,
// so no payload copy dereferences it.
unsafe impl Send for NullSink {}
unsafe impl Sync for NullSink {}

impl NullSink {
    fn new() -> Self {
        Self {
            byte: Box::new(UnsafeCell::new(0)),
        }
    }

    /// Stable address of the sink byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.byte.get()
    }
}

/// Connection-wide shared state.
#[derive(Debug)]
pub struct ConnState {
    connection_id: u32,
    params: Mutex<WireParams>,
    table: Mutex<Vec<Option<Arc<MessageSlot>>>>,
    null_sink: NullSink,
}

impl ConnState {
    /// Create an empty connection context.
    pub fn new(connection_id: u32) -> Self {
        Self {
            connection_id,
            params: Mutex::new(WireParams::default()),
            table: Mutex::new(vec![None; MSG_ID_SPACE]),
            null_sink: NullSink::new(),
        }
    }

    /// Connection identifier carried in control frames.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Replace the connection-wide default parameters.
    pub fn set_params(&self, params: WireParams) {
        *self.params.lock().expect("params poisoned") = params;
    }

    /// Snapshot of the connection-wide default parameters.
    pub fn params(&self) -> WireParams {
        *self.params.lock().expect("params poisoned")
    }

    /// Activate a message slot.
    ///
    /// Fails when the slot is still ACTIVE, or when the presented generation
    /// is not strictly greater than the previous occupant's.
    pub fn allocate_message_slot(
        &self,
        msg_id: u16,
        generation: u32,
        buffer: Box<[u8]>,
        params: WireParams,
    ) -> Result<Arc<MessageSlot>> {
        let id = usize::from(msg_id);
        if id >= MSG_ID_SPACE {
            return Err(Error::InvalidConfig("message id out of range"));
        }
        let mut table = self.table.lock().expect("message table poisoned");
        if let Some(existing) = &table[id] {
            if existing.state() == MessageState::Active {
                return Err(Error::ResourceExhausted);
            }
            if generation <= existing.generation() {
                return Err(Error::InvalidConfig(
                    "generation not newer than previous slot occupant",
                ));
            }
        }
        let (total_packets, total_chunks) = geometry(
            params.total_bytes,
            params.mtu_bytes,
            params.packets_per_chunk,
        );
        let slot = Arc::new(MessageSlot::new(
            msg_id,
            generation,
            buffer,
            total_packets,
            total_chunks,
            params,
        ));
        table[id] = Some(Arc::clone(&slot));
        Ok(slot)
    }

    /// Look up a live slot. Returns `None` for empty or NULL entries.
    pub fn get_message(&self, msg_id: u16) -> Option<Arc<MessageSlot>> {
        let id = usize::from(msg_id);
        if id >= MSG_ID_SPACE {
            return None;
        }
        let table = self.table.lock().expect("message table poisoned");
        table[id]
            .as_ref()
            .filter(|slot| slot.state() != MessageState::Null)
            .cloned()
    }

    /// Transition a slot to DEAD, redirect late writes at the null sink,
    /// and reclaim the backing buffer.
    pub fn complete_message(&self, msg_id: u16) -> Option<Box<[u8]>> {
        let slot = {
            let table = self.table.lock().expect("message table poisoned");
            table.get(usize::from(msg_id))?.clone()?
        };
        slot.complete(self.null_sink.as_ptr())
    }
}

/// Packet and chunk counts for a message of `total_bytes`.
pub fn geometry(total_bytes: u64, mtu_bytes: u32, packets_per_chunk: u16) -> (u32, u32) {
    if mtu_bytes == 0 || packets_per_chunk == 0 {
        return (0, 0);
    }
    let packets = (total_bytes + u64::from(mtu_bytes) - 1) / u64::from(mtu_bytes);
    let chunks = (packets + u64::from(packets_per_chunk) - 1) / u64::from(packets_per_chunk);
    (packets as u32, chunks as u32)
}
