//! Three-semaphore handshake over a single shared slot.
//!
//! # Protocol
//!
//! Semaphores, embedded in the region: `mem_lock` (1), `data_ready` (0),
//! `ack_ready` (0).
//!
//! **Sender, per chunk:**
//! 1. `wait(mem_lock)`: exclusive write access to the slot
//! 2. copy the payload in
//! 3. `post(data_ready)`
//! 4. `wait(ack_ready)`: the receiver has copied the slot out
//!
//! **Receiver, per chunk:**
//! 1. `wait(data_ready)`
//! 2. copy the slot out
//! 3. `post(mem_lock)`
//! 4. `post(ack_ready)`
//!
//! The `ack_ready` rendezvous already serialises cycles, so `mem_lock` never
//! blocks in a healthy run. It is kept: dropping it would change behaviour the
//! moment cycle ordering is relaxed.
//!
//! End of stream is one more full cycle whose payload is the `DONE` sentinel.
//!
//! ```text
//!  sender                         slot                       receiver
//!  wait(mem_lock) ──► write ──► post(data_ready) ─────────► wait(data_ready)
//!                                                            read
//!  wait(ack_ready) ◄────────── post(ack_ready) ◄─ post(mem_lock)
//! ```

use crate::error::TransportError;
use crate::shm_layout::{HandshakeSync, Protocol, RegionHeader, RegionLayout, header_len};
use crate::shm_region::{
    RegionHandle, ShmEndpoint, SlotView, acquire, attach_region, create_region,
};
use crate::{Cycle, Transport, require_role};
use quartz_chunk::{Chunk, Role, SENTINEL, is_sentinel};
use quartz_shm::Semaphore;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Shared-memory transport using the three-semaphore handshake.
///
/// The sender creates (and on close unlinks) the region; the receiver attaches
/// and only detaches.
pub struct HandshakeTransport {
    region: RegionHandle,
    layout: RegionLayout,
    role: Role,
    wait_timeout: Option<Duration>,
    finished: bool,
}

impl HandshakeTransport {
    fn parts(&mut self) -> Result<(SlotView<'_>, &HandshakeSync), TransportError> {
        let base = self.region.base()?;
        // SAFETY: the mapping was laid out with `self.layout` by the creator and
        // stays mapped until `close`, which needs `&mut self`.
        unsafe {
            let view = SlotView::new(base, &self.layout);
            let sync = &*(base.add(header_len()) as *const HandshakeSync);
            Ok((view, sync))
        }
    }

    fn cycle(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        if payload.len() > self.layout.slot_capacity {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                capacity: self.layout.slot_capacity,
            });
        }
        let timeout = self.wait_timeout;
        let (view, sync) = self.parts()?;

        acquire(&sync.mem_lock, "mem_lock", timeout)?;
        let start = Instant::now();
        view.write(payload)?;
        let active = start.elapsed();
        sync.data_ready.post()?;
        acquire(&sync.ack_ready, "ack_ready", timeout)?;

        trace!(bytes = payload.len(), "handshake cycle acknowledged");
        Ok(Cycle {
            bytes: payload.len(),
            active,
        })
    }

    /// Times a reader and writer were inside the slot at once. Zero unless the
    /// protocol is broken.
    pub fn overlap_violations(&mut self) -> Result<u64, TransportError> {
        let (view, _) = self.parts()?;
        Ok(view.header.occupancy.overlap_violations())
    }

    /// Cycles the sender has published, sentinel included.
    pub fn cycles_published(&mut self) -> Result<u64, TransportError> {
        let (view, _) = self.parts()?;
        Ok(view
            .header
            .cycles
            .load(std::sync::atomic::Ordering::Relaxed))
    }

    /// Current `(mem_lock, data_ready, ack_ready)` counts.
    #[cfg(target_os = "linux")]
    pub fn semaphore_counts(&mut self) -> Result<(i32, i32, i32), TransportError> {
        let (_, sync) = self.parts()?;
        Ok((
            sync.mem_lock.value()?,
            sync.data_ready.value()?,
            sync.ack_ready.value()?,
        ))
    }
}

impl Transport for HandshakeTransport {
    type Endpoint = ShmEndpoint;

    const KIND: &'static str = "handshake";

    fn open_as_sender(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let layout = RegionLayout::for_protocol(Protocol::Handshake, ep.chunk_size);
        let mut region = create_region(ep, &layout)?;
        let base = region.as_mut_ptr().ok_or(TransportError::Closed)?;

        // SAFETY: fresh zero-filled mapping of `layout.total_len` bytes; no
        // receiver trusts it before the header magic is published, which
        // happens last.
        unsafe {
            HandshakeSync::init(base.add(header_len()) as *mut HandshakeSync)
                .map_err(|e| TransportError::setup("initialise handshake semaphores", e))?;
            RegionHeader::init(base, Protocol::Handshake, ep.chunk_size, ep.total_bytes);
        }

        info!(
            region = %ep.name,
            chunk_size = ep.chunk_size,
            total_bytes = ep.total_bytes,
            "handshake sender ready"
        );
        Ok(Self {
            region: RegionHandle::Owned(region),
            layout,
            role: Role::Sender,
            wait_timeout: ep.wait_timeout,
            finished: false,
        })
    }

    fn open_as_receiver(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let layout = RegionLayout::for_protocol(Protocol::Handshake, ep.chunk_size);
        let region = attach_region(ep, Protocol::Handshake, &layout)?;

        info!(region = %ep.name, chunk_size = ep.chunk_size, "handshake receiver attached");
        Ok(Self {
            region: RegionHandle::Attached(region),
            layout,
            role: Role::Receiver,
            wait_timeout: ep.wait_timeout,
            finished: false,
        })
    }

    fn role(&self) -> Role {
        self.role
    }

    fn send_chunk(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        require_role(self.role, Role::Sender, "send_chunk")?;
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.cycle(payload)
    }

    fn recv_chunk(&mut self, into: &mut Chunk) -> Result<Option<Cycle>, TransportError> {
        require_role(self.role, Role::Receiver, "recv_chunk")?;
        if self.finished {
            return Ok(None);
        }
        let timeout = self.wait_timeout;
        let (view, sync) = self.parts()?;

        acquire(&sync.data_ready, "data_ready", timeout)?;
        let start = Instant::now();
        let copied = view.read_into(into.as_mut_slice());
        let active = start.elapsed();
        // Hand the slot back even if the copy failed so the sender is not left
        // waiting on ack_ready.
        sync.mem_lock.post()?;
        sync.ack_ready.post()?;
        let len = copied?;

        if is_sentinel(into.head(len)) {
            info!("handshake receiver saw end of stream");
            self.finished = true;
            return Ok(None);
        }
        trace!(bytes = len, "handshake chunk received");
        Ok(Some(Cycle { bytes: len, active }))
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        require_role(self.role, Role::Sender, "finish")?;
        if self.finished {
            return Ok(());
        }
        self.cycle(SENTINEL)?;
        self.finished = true;
        info!("handshake sender sent end of stream");
        Ok(())
    }

    fn close(&mut self) {
        self.region.release();
    }

    fn is_closed(&self) -> bool {
        self.region.is_released()
    }
}
