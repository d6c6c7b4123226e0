use crate::ownership::{Attached, Owner, Ownership};
use memmap2::MmapMut;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::{debug, info};

/// A named POSIX shared-memory mapping.
///
/// `SharedRegion<Owner>` is created by the sender, sized once and never
/// resized. `SharedRegion<Attached>` is opened by the receiver and maps the
/// whole object at whatever size the owner gave it.
///
/// Releasing is idempotent: the second call to [`release`](Self::release) (or
/// the drop that follows an explicit release) does nothing.
pub struct SharedRegion<O: Ownership> {
    name: String,
    mmap: Option<MmapMut>,
    len: usize,
    _o: PhantomData<O>,
}

/// Prefixes `name` with `/` when missing, as `shm_open` and `sem_open` expect.
pub fn normalize_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"))
}

fn shm_open(name: &str, oflag: libc::c_int) -> io::Result<File> {
    let c_name = c_name(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor that nothing else owns.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

fn shm_unlink(name: &str) -> io::Result<bool> {
    let c_name = c_name(name)?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::NotFound {
        Ok(false)
    } else {
        Err(err)
    }
}

impl SharedRegion<Owner> {
    /// Creates a new shared-memory object of `size_bytes` and maps it
    /// read-write. Fails with `AlreadyExists` if the name is taken.
    ///
    /// The fresh mapping is zero-filled.
    pub fn create(name: &str, size_bytes: usize) -> io::Result<Self> {
        let name = normalize_name(name);
        let file = shm_open(&name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        let mapped = file
            .set_len(size_bytes as u64)
            .and_then(|_| unsafe { MmapMut::map_mut(&file) });
        let mmap = match mapped {
            Ok(m) => m,
            Err(e) => {
                // The name exists but is unusable; do not leave it behind.
                let _ = shm_unlink(&name);
                return Err(e);
            }
        };

        info!(region = %name, bytes = size_bytes, "created shared region");
        Ok(Self {
            name,
            len: mmap.len(),
            mmap: Some(mmap),
            _o: PhantomData,
        })
    }

    /// Removes a name left behind by an earlier run that never cleaned up.
    /// Returns whether anything was removed.
    pub fn remove_stale(name: &str) -> io::Result<bool> {
        let name = normalize_name(name);
        let removed = shm_unlink(&name)?;
        if removed {
            info!(region = %name, "removed stale shared region");
        }
        Ok(removed)
    }
}

impl SharedRegion<Attached> {
    /// Opens and maps an existing shared-memory object read-write.
    ///
    /// Returns `NotFound` when no object has that name and `WouldBlock` when
    /// the object exists but the owner has not sized it yet.
    pub fn open(name: &str) -> io::Result<Self> {
        let name = normalize_name(name);
        let file = shm_open(&name, libc::O_RDWR)?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "shared region exists but is not sized yet",
            ));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        info!(region = %name, bytes = mmap.len(), "attached shared region");
        Ok(Self {
            name,
            len: mmap.len(),
            mmap: Some(mmap),
            _o: PhantomData,
        })
    }
}

impl<O: Ownership> SharedRegion<O> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes. Stays the same after release.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.mmap.is_none()
    }

    /// Start of the mapping, or `None` once released.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        self.mmap.as_mut().map(|m| m.as_mut_ptr())
    }

    /// Unmaps the region; an owner also unlinks the name. No-op when already
    /// released.
    pub fn release(&mut self) {
        let Some(mmap) = self.mmap.take() else {
            return;
        };
        drop(mmap);

        if O::UNLINK_ON_RELEASE {
            match shm_unlink(&self.name) {
                Ok(_) => {}
                Err(e) => debug!(region = %self.name, error = %e, "shm_unlink failed"),
            }
        }
        debug!(region = %self.name, role = O::LABEL, "released shared region");
    }
}

impl<O: Ownership> Drop for SharedRegion<O> {
    fn drop(&mut self) {
        self.release();
    }
}
