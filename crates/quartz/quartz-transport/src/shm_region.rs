//! Creating, attaching and accessing the shared region of the two
//! shared-memory transports.

use crate::error::TransportError;
use crate::shm_layout::{Protocol, RegionHeader, RegionLayout};
use quartz_shm::{Attached, Owner, Semaphore, SharedRegion, normalize_name};
use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where and how a shared-memory transport rendezvous.
#[derive(Debug, Clone)]
pub struct ShmEndpoint {
    /// Region name; semaphore names are derived from it.
    pub name: String,
    pub chunk_size: usize,
    pub total_bytes: u64,
    /// Unlink leftovers from a crashed run before creating.
    pub reclaim_stale: bool,
    /// How long a receiver keeps retrying to attach.
    pub attach_timeout: Duration,
    /// `None` blocks forever on every semaphore wait.
    pub wait_timeout: Option<Duration>,
}

impl ShmEndpoint {
    pub fn new(name: &str, chunk_size: usize, total_bytes: u64) -> Self {
        Self {
            name: normalize_name(name),
            chunk_size,
            total_bytes,
            reclaim_stale: true,
            attach_timeout: Duration::from_secs(5),
            wait_timeout: None,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// `{name}_{suffix}`, e.g. `/quartz_shm_empty`.
    pub fn semaphore_name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.name)
    }
}

/// The region as seen by either side. Only the sender ever holds `Owned`.
pub(crate) enum RegionHandle {
    Owned(SharedRegion<Owner>),
    Attached(SharedRegion<Attached>),
}

impl RegionHandle {
    pub(crate) fn base(&mut self) -> Result<*mut u8, TransportError> {
        let base = match self {
            RegionHandle::Owned(r) => r.as_mut_ptr(),
            RegionHandle::Attached(r) => r.as_mut_ptr(),
        };
        base.ok_or(TransportError::Closed)
    }

    pub(crate) fn release(&mut self) {
        match self {
            RegionHandle::Owned(r) => r.release(),
            RegionHandle::Attached(r) => r.release(),
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        match self {
            RegionHandle::Owned(r) => r.is_released(),
            RegionHandle::Attached(r) => r.is_released(),
        }
    }
}

pub(crate) fn create_region(
    ep: &ShmEndpoint,
    layout: &RegionLayout,
) -> Result<SharedRegion<Owner>, TransportError> {
    if ep.reclaim_stale {
        SharedRegion::<Owner>::remove_stale(&ep.name).map_err(|e| {
            TransportError::setup(format!("remove stale region '{}'", ep.name), e)
        })?;
    }
    SharedRegion::<Owner>::create(&ep.name, layout.total_len)
        .map_err(|e| TransportError::setup(format!("create shared region '{}'", ep.name), e))
}

/// Opens the region, retrying until a live creator has published the header
/// or `attach_timeout` runs out, then checks it matches this side's settings.
pub(crate) fn attach_region(
    ep: &ShmEndpoint,
    protocol: Protocol,
    layout: &RegionLayout,
) -> Result<SharedRegion<Attached>, TransportError> {
    let deadline = Instant::now() + ep.attach_timeout;
    let incompatible = |reason: String| TransportError::Incompatible {
        region: ep.name.clone(),
        reason,
    };

    loop {
        match SharedRegion::<Attached>::open(&ep.name) {
            Ok(mut region) => {
                if region.len() < size_of::<RegionHeader>() {
                    return Err(incompatible(format!("only {} bytes", region.len())));
                }
                let base = region.as_mut_ptr().ok_or(TransportError::Closed)?;
                // SAFETY: mapping is at least one header long and stays mapped
                // while `region` lives.
                let header = unsafe { &*(base as *const RegionHeader) };
                if !header.is_published() {
                    debug!(region = %ep.name, "region not published yet");
                } else if !header.creator_alive() {
                    debug!(
                        region = %ep.name,
                        creator = header.creator_pid,
                        "region left by an exited sender, waiting for a fresh one"
                    );
                } else {
                    header
                        .validate(protocol, ep.chunk_size, ep.total_bytes)
                        .map_err(incompatible)?;
                    if region.len() < layout.total_len {
                        return Err(incompatible(format!(
                            "{} bytes mapped, {} required",
                            region.len(),
                            layout.total_len
                        )));
                    }
                    return Ok(region);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::WouldBlock) => {}
            Err(e) => {
                return Err(TransportError::setup(
                    format!("attach shared region '{}'", ep.name),
                    e,
                ));
            }
        }

        if Instant::now() >= deadline {
            return Err(TransportError::PeerUnavailable {
                endpoint: ep.name.clone(),
                waited: ep.attach_timeout,
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Waits on `sem`, mapping an expired timed wait to `TransportError::Timeout`.
pub(crate) fn acquire<S: Semaphore + ?Sized>(
    sem: &S,
    name: &'static str,
    timeout: Option<Duration>,
) -> Result<(), TransportError> {
    if sem.wait_for(timeout)? {
        Ok(())
    } else {
        Err(TransportError::Timeout {
            semaphore: name,
            after: timeout.unwrap_or_default(),
        })
    }
}

/// Header plus slot of a mapped region.
pub(crate) struct SlotView<'a> {
    pub(crate) header: &'a RegionHeader,
    slot: *mut u8,
    capacity: usize,
}

impl<'a> SlotView<'a> {
    /// # Safety
    /// `base` must be the start of a live mapping laid out as `layout`, and
    /// the returned view must not outlive it.
    pub(crate) unsafe fn new(base: *mut u8, layout: &RegionLayout) -> Self {
        unsafe {
            Self {
                header: &*(base as *const RegionHeader),
                slot: base.add(layout.slot_offset),
                capacity: layout.slot_capacity,
            }
        }
    }

    /// Copies `payload` into the slot and records its length. The caller must
    /// hold the protocol's write permission.
    pub(crate) fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.capacity {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        let occupancy = &self.header.occupancy;
        occupancy.enter_write();
        // SAFETY: slot is `capacity` bytes long and the protocol grants this
        // side exclusive access for the duration of the copy.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), self.slot, payload.len()) };
        self.header
            .payload_len
            .store(payload.len() as u64, Ordering::Release);
        self.header.cycles.fetch_add(1, Ordering::Relaxed);
        occupancy.leave_write();
        Ok(())
    }

    /// Copies the current payload out into `out`, returning its length. The
    /// caller must hold the protocol's read permission.
    pub(crate) fn read_into(&self, out: &mut [u8]) -> Result<usize, TransportError> {
        let len = self.header.payload_len.load(Ordering::Acquire) as usize;
        if len > out.len() || len > self.capacity {
            return Err(TransportError::FrameTooLarge {
                len,
                capacity: out.len().min(self.capacity),
            });
        }
        let occupancy = &self.header.occupancy;
        occupancy.enter_read();
        // SAFETY: as in `write`, with the read permission held.
        unsafe { ptr::copy_nonoverlapping(self.slot as *const u8, out.as_mut_ptr(), len) };
        occupancy.leave_read();
        Ok(len)
    }
}
