//! Binary layout of the single-slot shared region.
//!
//! Both shared-memory transports map one region holding a header and exactly
//! one chunk slot. The handshake protocol additionally embeds its three
//! semaphores between the header and the slot; the ring-slot protocol keeps its
//! semaphores outside the region as named objects.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        RegionHeader                            │
//! │  magic · version · protocol · slot_capacity · total_bytes      │
//! │  creator_pid                                                   │
//! │  payload_len (atomic) · cycles (atomic) · SlotOccupancy        │
//! ├────────────────────────────────────────────────────────────────┤
//! │            HandshakeSync (handshake protocol only)             │
//! │      mem_lock (1) · data_ready (0) · ack_ready (0)             │
//! ├────────────────────────────────────────────────────────────────┤
//! │                       slot: [u8; slot_capacity]                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The region is sized once by the creator and never resized.

use quartz_shm::ProcessSemaphore;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// ASCII "QUARTZSH". Published last by the creator; a reader that sees it knows
/// the rest of the header and the embedded semaphores are initialised.
pub const REGION_MAGIC: u64 = 0x5155_4152_545A_5348;

/// Bump on any incompatible layout change.
pub const REGION_VERSION: u64 = 2;

const SLOT_ALIGN: usize = 64;

/// Synchronisation protocol a region was created for.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Handshake = 1,
    RingSlot = 2,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Handshake => "handshake",
            Protocol::RingSlot => "ring_slot",
        }
    }
}

/// Counts processes inside the slot.
///
/// Every copy into or out of the slot is bracketed by `enter_*`/`leave_*`. A
/// side that enters while the other side is inside bumps
/// `overlap_violations`; under a correct protocol it stays at zero forever.
#[repr(C)]
pub struct SlotOccupancy {
    writers: AtomicU32,
    readers: AtomicU32,
    overlap_violations: AtomicU64,
}

impl SlotOccupancy {
    #[inline]
    pub fn enter_write(&self) {
        self.writers.fetch_add(1, Ordering::SeqCst);
        if self.readers.load(Ordering::SeqCst) != 0 {
            self.overlap_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn leave_write(&self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn enter_read(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) != 0 {
            self.overlap_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn leave_read(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn overlap_violations(&self) -> u64 {
        self.overlap_violations.load(Ordering::Relaxed)
    }
}

/// Header at offset 0 of every region.
#[repr(C, align(64))]
pub struct RegionHeader {
    /// Must equal `REGION_MAGIC`. Stored with Release after everything else.
    pub magic: AtomicU64,
    pub version: u64,
    pub protocol: u64,
    /// Slot size in bytes (the run's chunk_size).
    pub slot_capacity: u64,
    /// Bytes the sender intends to move in this run.
    pub total_bytes: u64,
    /// Process that created the region. A header whose creator has exited is
    /// a crashed run's leftover, not a published region.
    pub creator_pid: u64,
    /// Valid bytes in the slot for the current cycle.
    pub payload_len: AtomicU64,
    /// Cycles published by the sender, sentinel included.
    pub cycles: AtomicU64,
    pub occupancy: SlotOccupancy,
}

impl RegionHeader {
    /// Writes a fresh header at `base` and publishes the magic.
    ///
    /// # Safety
    /// `base` must point to a zero-filled, writable mapping of at least
    /// `size_of::<RegionHeader>()` bytes that no reader trusts until the magic
    /// is visible.
    pub unsafe fn init(
        base: *mut u8,
        protocol: Protocol,
        slot_capacity: usize,
        total_bytes: u64,
    ) {
        let h = base as *mut RegionHeader;
        unsafe {
            (*h).version = REGION_VERSION;
            (*h).protocol = protocol as u64;
            (*h).slot_capacity = slot_capacity as u64;
            (*h).total_bytes = total_bytes;
            (*h).creator_pid = u64::from(std::process::id());
            (*h).payload_len.store(0, Ordering::Relaxed);
            (*h).cycles.store(0, Ordering::Relaxed);
            (*h).magic.store(REGION_MAGIC, Ordering::Release);
        }
    }

    /// True once the creator has finished initialising the region.
    #[inline]
    pub fn is_published(&self) -> bool {
        self.magic.load(Ordering::Acquire) == REGION_MAGIC
    }

    /// False once the creating process is gone. Only meaningful on a
    /// published header.
    pub fn creator_alive(&self) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.creator_pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 only checks that `pid` exists; nothing is delivered.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM still means the process exists.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    /// Checks the header against what the attaching process was configured
    /// with. Call only after [`is_published`](Self::is_published).
    pub fn validate(
        &self,
        protocol: Protocol,
        slot_capacity: usize,
        total_bytes: u64,
    ) -> Result<(), String> {
        if !self.is_published() {
            return Err("bad magic".into());
        }
        if self.version != REGION_VERSION {
            return Err(format!(
                "layout version {} (expected {REGION_VERSION})",
                self.version
            ));
        }
        if self.protocol != protocol as u64 {
            return Err(format!(
                "created for protocol id {} (expected {} = {})",
                self.protocol,
                protocol as u64,
                protocol.name()
            ));
        }
        if self.slot_capacity != slot_capacity as u64 {
            return Err(format!(
                "chunk_size {} (expected {slot_capacity})",
                self.slot_capacity
            ));
        }
        if self.total_bytes != total_bytes {
            return Err(format!(
                "total_size {} (expected {total_bytes})",
                self.total_bytes
            ));
        }
        Ok(())
    }
}

/// The three handshake semaphores.
#[repr(C, align(64))]
pub struct HandshakeSync {
    /// Mutual exclusion over the slot. Initial 1.
    pub mem_lock: ProcessSemaphore,
    /// Sender to receiver: a chunk is in the slot. Initial 0.
    pub data_ready: ProcessSemaphore,
    /// Receiver to sender: the slot has been copied out. Initial 0.
    pub ack_ready: ProcessSemaphore,
}

impl HandshakeSync {
    /// # Safety
    /// Same contract as [`ProcessSemaphore::init_at`] for all three fields.
    pub unsafe fn init(at: *mut HandshakeSync) -> std::io::Result<()> {
        unsafe {
            ProcessSemaphore::init_at(std::ptr::addr_of_mut!((*at).mem_lock), 1)?;
            ProcessSemaphore::init_at(std::ptr::addr_of_mut!((*at).data_ready), 0)?;
            ProcessSemaphore::init_at(std::ptr::addr_of_mut!((*at).ack_ready), 0)?;
        }
        Ok(())
    }
}

/// Byte offsets inside a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub sync_offset: Option<usize>,
    pub slot_offset: usize,
    pub slot_capacity: usize,
    pub total_len: usize,
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bytes reserved for the header; the handshake semaphores start here.
pub const fn header_len() -> usize {
    align_up(size_of::<RegionHeader>(), SLOT_ALIGN)
}

impl RegionLayout {
    /// Region size is always header + (sync) + slot.
    pub fn for_protocol(protocol: Protocol, slot_capacity: usize) -> Self {
        let header = header_len();
        let (sync_offset, slot_offset) = match protocol {
            Protocol::Handshake => {
                let sync = align_up(size_of::<HandshakeSync>(), SLOT_ALIGN);
                (Some(header), header + sync)
            }
            Protocol::RingSlot => (None, header),
        };
        Self {
            sync_offset,
            slot_offset,
            slot_capacity,
            total_len: slot_offset + slot_capacity,
        }
    }
}
