//! Single-slot bounded buffer over shared memory.
//!
//! Two named semaphores, `{name}_empty` (initial 1) and `{name}_full`
//! (initial 0). The sender waits `empty`, writes, posts `full`; the receiver
//! waits `full`, reads, posts `empty`. Exactly one of the two is ever
//! signalled, so the counts always sum to 0 or 1.
//!
//! Unlike the handshake there is no acknowledgement: `send_chunk` returns as
//! soon as the chunk is in the slot, and the next send blocks until the
//! receiver has drained it.

use crate::error::TransportError;
use crate::shm_layout::{Protocol, RegionHeader, RegionLayout};
use crate::shm_region::{RegionHandle, ShmEndpoint, SlotView, acquire, attach_region, create_region};
use crate::{Cycle, Transport, require_role};
use quartz_chunk::{Chunk, Role, SENTINEL, is_sentinel};
use quartz_shm::{Attached, NamedSemaphore, Owner, Semaphore};
use std::time::{Duration, Instant};
use tracing::{info, trace};

const EMPTY: &str = "empty";
const FULL: &str = "full";

enum SlotSemaphores {
    Owned {
        empty: NamedSemaphore<Owner>,
        full: NamedSemaphore<Owner>,
    },
    Attached {
        empty: NamedSemaphore<Attached>,
        full: NamedSemaphore<Attached>,
    },
}

impl SlotSemaphores {
    fn create(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let empty_name = ep.semaphore_name(EMPTY);
        let full_name = ep.semaphore_name(FULL);
        if ep.reclaim_stale {
            for name in [&empty_name, &full_name] {
                NamedSemaphore::<Owner>::remove_stale(name).map_err(|e| {
                    TransportError::setup(format!("remove stale semaphore '{name}'"), e)
                })?;
            }
        }
        let empty = NamedSemaphore::<Owner>::create(&empty_name, 1).map_err(|e| {
            TransportError::setup(format!("create semaphore '{empty_name}'"), e)
        })?;
        // `empty` unlinks itself on drop if this fails.
        let full = NamedSemaphore::<Owner>::create(&full_name, 0)
            .map_err(|e| TransportError::setup(format!("create semaphore '{full_name}'"), e))?;
        Ok(SlotSemaphores::Owned { empty, full })
    }

    fn open(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let open = |suffix: &str| {
            let name = ep.semaphore_name(suffix);
            NamedSemaphore::<Attached>::open(&name)
                .map_err(|e| TransportError::setup(format!("open semaphore '{name}'"), e))
        };
        Ok(SlotSemaphores::Attached {
            empty: open(EMPTY)?,
            full: open(FULL)?,
        })
    }

    fn empty(&self) -> &dyn Semaphore {
        match self {
            SlotSemaphores::Owned { empty, .. } => empty,
            SlotSemaphores::Attached { empty, .. } => empty,
        }
    }

    fn full(&self) -> &dyn Semaphore {
        match self {
            SlotSemaphores::Owned { full, .. } => full,
            SlotSemaphores::Attached { full, .. } => full,
        }
    }

    #[cfg(target_os = "linux")]
    fn counts(&self) -> std::io::Result<(i32, i32)> {
        match self {
            SlotSemaphores::Owned { empty, full } => Ok((empty.value()?, full.value()?)),
            SlotSemaphores::Attached { empty, full } => Ok((empty.value()?, full.value()?)),
        }
    }

    fn close(&mut self) {
        match self {
            SlotSemaphores::Owned { empty, full } => {
                empty.close();
                full.close();
            }
            SlotSemaphores::Attached { empty, full } => {
                empty.close();
                full.close();
            }
        }
    }
}

/// Shared-memory transport using the two-semaphore bounded buffer.
pub struct RingSlotTransport {
    region: RegionHandle,
    sems: SlotSemaphores,
    layout: RegionLayout,
    role: Role,
    wait_timeout: Option<Duration>,
    finished: bool,
}

impl RingSlotTransport {
    fn view(&mut self) -> Result<SlotView<'_>, TransportError> {
        let base = self.region.base()?;
        // SAFETY: laid out with `self.layout` by the creator, mapped until
        // `close`, which needs `&mut self`.
        Ok(unsafe { SlotView::new(base, &self.layout) })
    }

    fn put(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        if payload.len() > self.layout.slot_capacity {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                capacity: self.layout.slot_capacity,
            });
        }
        let timeout = self.wait_timeout;
        let base = self.region.base()?;
        // SAFETY: as in `view`; borrowing `sems` alongside needs the raw base.
        let view = unsafe { SlotView::new(base, &self.layout) };

        acquire(self.sems.empty(), "slot_empty", timeout)?;
        let start = Instant::now();
        view.write(payload)?;
        let active = start.elapsed();
        self.sems.full().post()?;

        trace!(bytes = payload.len(), "ring slot filled");
        Ok(Cycle {
            bytes: payload.len(),
            active,
        })
    }

    /// Times a reader and writer were inside the slot at once.
    pub fn overlap_violations(&mut self) -> Result<u64, TransportError> {
        Ok(self.view()?.header.occupancy.overlap_violations())
    }

    /// Current `(slot_empty, slot_full)` counts.
    #[cfg(target_os = "linux")]
    pub fn semaphore_counts(&self) -> Result<(i32, i32), TransportError> {
        Ok(self.sems.counts()?)
    }
}

impl Transport for RingSlotTransport {
    type Endpoint = ShmEndpoint;

    const KIND: &'static str = "ring_slot";

    /// Semaphores first, then the region: a receiver that sees the published
    /// header can always open both semaphores.
    fn open_as_sender(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let layout = RegionLayout::for_protocol(Protocol::RingSlot, ep.chunk_size);
        let sems = SlotSemaphores::create(ep)?;
        let mut region = create_region(ep, &layout)?;
        let base = region.as_mut_ptr().ok_or(TransportError::Closed)?;
        // SAFETY: fresh zero-filled mapping of `layout.total_len` bytes.
        unsafe { RegionHeader::init(base, Protocol::RingSlot, ep.chunk_size, ep.total_bytes) };

        info!(
            region = %ep.name,
            chunk_size = ep.chunk_size,
            total_bytes = ep.total_bytes,
            "ring slot sender ready"
        );
        Ok(Self {
            region: RegionHandle::Owned(region),
            sems,
            layout,
            role: Role::Sender,
            wait_timeout: ep.wait_timeout,
            finished: false,
        })
    }

    fn open_as_receiver(ep: &ShmEndpoint) -> Result<Self, TransportError> {
        let layout = RegionLayout::for_protocol(Protocol::RingSlot, ep.chunk_size);
        let region = attach_region(ep, Protocol::RingSlot, &layout)?;
        let sems = SlotSemaphores::open(ep)?;

        info!(region = %ep.name, chunk_size = ep.chunk_size, "ring slot receiver attached");
        Ok(Self {
            region: RegionHandle::Attached(region),
            sems,
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
        self.put(payload)
    }

    fn recv_chunk(&mut self, into: &mut Chunk) -> Result<Option<Cycle>, TransportError> {
        require_role(self.role, Role::Receiver, "recv_chunk")?;
        if self.finished {
            return Ok(None);
        }
        let timeout = self.wait_timeout;
        let base = self.region.base()?;
        // SAFETY: see `view`.
        let view = unsafe { SlotView::new(base, &self.layout) };

        acquire(self.sems.full(), "slot_full", timeout)?;
        let start = Instant::now();
        let copied = view.read_into(into.as_mut_slice());
        let active = start.elapsed();
        self.sems.empty().post()?;
        let len = copied?;

        if is_sentinel(into.head(len)) {
            info!("ring slot receiver saw end of stream");
            self.finished = true;
            return Ok(None);
        }
        trace!(bytes = len, "ring slot drained");
        Ok(Some(Cycle { bytes: len, active }))
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        require_role(self.role, Role::Sender, "finish")?;
        if self.finished {
            return Ok(());
        }
        self.put(SENTINEL)?;
        self.finished = true;
        info!("ring slot sender sent end of stream");
        Ok(())
    }

    fn close(&mut self) {
        self.sems.close();
        self.region.release();
    }

    fn is_closed(&self) -> bool {
        self.region.is_released()
    }
}
