//! Cross-process counting semaphores.
//!
//! Two flavours back the same [`Semaphore`] operations:
//!
//! - [`ProcessSemaphore`] lives inside a shared region (`sem_init` with
//!   `pshared = 1`). Its name is the region's name; it dies with the mapping.
//! - [`NamedSemaphore`] is a standalone `sem_open` object with its own name.
//!   The owner creates and unlinks it; an attached handle only closes it.
//!
//! All waits retry on `EINTR`. A plain `wait` blocks with no upper bound; a
//! crashed peer leaves the other side blocked forever unless the caller opts
//! into `wait_timeout`.

use crate::ownership::{Attached, Owner, Ownership};
use crate::region::normalize_name;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info};

/// Counting semaphore shared between processes.
pub trait Semaphore {
    /// Blocks until the count is positive, then decrements it.
    fn wait(&self) -> io::Result<()>;

    /// Decrements if the count is positive. Never blocks.
    fn try_wait(&self) -> io::Result<bool>;

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns `false`
    /// on expiry.
    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool>;

    /// Increments the count, waking one waiter.
    fn post(&self) -> io::Result<()>;

    /// Untimed wait when `timeout` is `None`.
    fn wait_for(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match timeout {
            None => self.wait().map(|_| true),
            Some(t) => self.wait_timeout(t),
        }
    }
}

// ─── Raw operations ────────────────────────────────────────────────────────

unsafe fn raw_wait(sem: *mut libc::sem_t) -> io::Result<()> {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

unsafe fn raw_try_wait(sem: *mut libc::sem_t) -> io::Result<bool> {
    loop {
        if unsafe { libc::sem_trywait(sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err),
        }
    }
}

unsafe fn raw_post(sem: *mut libc::sem_t) -> io::Result<()> {
    if unsafe { libc::sem_post(sem) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
unsafe fn raw_wait_timeout(sem: *mut libc::sem_t, timeout: Duration) -> io::Result<bool> {
    // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let total_nsec = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let extra_secs = timeout.as_secs() + total_nsec / 1_000_000_000;
    let deadline = libc::timespec {
        tv_sec: now.tv_sec + extra_secs as libc::time_t,
        tv_nsec: (total_nsec % 1_000_000_000) as _,
    };

    loop {
        if unsafe { libc::sem_timedwait(sem, &deadline) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err),
        }
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn raw_wait_timeout(sem: *mut libc::sem_t, timeout: Duration) -> io::Result<bool> {
    // No sem_timedwait here: poll with a short sleep.
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if unsafe { raw_try_wait(sem)? } {
            return Ok(true);
        }
        if std::time::Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}

// ─── Region-embedded semaphore ─────────────────────────────────────────────

/// A `sem_t` placed inside a shared mapping and initialised process-shared.
///
/// Only ever handled by reference into the mapping; it is never moved.
#[repr(C)]
pub struct ProcessSemaphore {
    raw: UnsafeCell<libc::sem_t>,
}

// SAFETY: sem_* operations are safe to call concurrently from any thread or
// process on an initialised process-shared semaphore.
unsafe impl Sync for ProcessSemaphore {}
unsafe impl Send for ProcessSemaphore {}

impl ProcessSemaphore {
    /// Initialises the semaphore at `slot` with `initial` count.
    ///
    /// # Safety
    /// `slot` must point to suitably aligned, writable memory inside a
    /// `MAP_SHARED` mapping that outlives every use of the semaphore, and no
    /// other process may touch it until this returns.
    pub unsafe fn init_at(slot: *mut ProcessSemaphore, initial: u32) -> io::Result<()> {
        let raw = unsafe { UnsafeCell::raw_get(std::ptr::addr_of!((*slot).raw)) };
        if unsafe { libc::sem_init(raw, 1, initial as libc::c_uint) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    fn as_ptr(&self) -> *mut libc::sem_t {
        self.raw.get()
    }

    /// Current count.
    #[cfg(target_os = "linux")]
    pub fn value(&self) -> io::Result<i32> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.as_ptr(), &mut v) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(v)
    }
}

impl Semaphore for ProcessSemaphore {
    fn wait(&self) -> io::Result<()> {
        unsafe { raw_wait(self.as_ptr()) }
    }

    fn try_wait(&self) -> io::Result<bool> {
        unsafe { raw_try_wait(self.as_ptr()) }
    }

    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        unsafe { raw_wait_timeout(self.as_ptr(), timeout) }
    }

    fn post(&self) -> io::Result<()> {
        unsafe { raw_post(self.as_ptr()) }
    }
}

// ─── Named semaphore ───────────────────────────────────────────────────────

/// A `sem_open` semaphore. `NamedSemaphore<Owner>` unlinks the name on close;
/// `NamedSemaphore<Attached>` only closes its handle.
pub struct NamedSemaphore<O: Ownership> {
    name: String,
    sem: *mut libc::sem_t,
    _o: PhantomData<O>,
}

// SAFETY: the handle is a process-wide pointer returned by sem_open; every
// operation on it is thread-safe.
unsafe impl<O: Ownership> Send for NamedSemaphore<O> {}
unsafe impl<O: Ownership> Sync for NamedSemaphore<O> {}

fn sem_unlink(name: &str) -> io::Result<bool> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "semaphore name contains NUL"))?;
    if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::NotFound {
        Ok(false)
    } else {
        Err(err)
    }
}

fn sem_open(name: &str, create: Option<u32>) -> io::Result<*mut libc::sem_t> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "semaphore name contains NUL"))?;
    let sem = match create {
        Some(initial) => unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        },
        None => unsafe { libc::sem_open(c_name.as_ptr(), 0) },
    };
    if sem == libc::SEM_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(sem)
}

impl NamedSemaphore<Owner> {
    /// Creates a new named semaphore with `initial` count. Fails with
    /// `AlreadyExists` if the name is taken.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let name = normalize_name(name);
        let sem = sem_open(&name, Some(initial))?;
        info!(semaphore = %name, initial, "created named semaphore");
        Ok(Self {
            name,
            sem,
            _o: PhantomData,
        })
    }

    /// Unlinks a name left behind by an earlier run. Returns whether anything
    /// was removed.
    pub fn remove_stale(name: &str) -> io::Result<bool> {
        let name = normalize_name(name);
        let removed = sem_unlink(&name)?;
        if removed {
            info!(semaphore = %name, "removed stale named semaphore");
        }
        Ok(removed)
    }
}

impl NamedSemaphore<Attached> {
    /// Opens an existing named semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let name = normalize_name(name);
        let sem = sem_open(&name, None)?;
        debug!(semaphore = %name, "opened named semaphore");
        Ok(Self {
            name,
            sem,
            _o: PhantomData,
        })
    }
}

impl<O: Ownership> NamedSemaphore<O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.sem.is_null()
    }

    fn handle(&self) -> io::Result<*mut libc::sem_t> {
        if self.sem.is_null() {
            Err(io::Error::new(io::ErrorKind::NotConnected, "semaphore closed"))
        } else {
            Ok(self.sem)
        }
    }

    /// Current count.
    #[cfg(target_os = "linux")]
    pub fn value(&self) -> io::Result<i32> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.handle()?, &mut v) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(v)
    }

    /// Closes the handle; an owner also unlinks the name. No-op when already
    /// closed.
    pub fn close(&mut self) {
        if self.sem.is_null() {
            return;
        }
        unsafe { libc::sem_close(self.sem) };
        self.sem = std::ptr::null_mut();

        if O::UNLINK_ON_RELEASE {
            if let Err(e) = sem_unlink(&self.name) {
                debug!(semaphore = %self.name, error = %e, "sem_unlink failed");
            }
        }
        debug!(semaphore = %self.name, role = O::LABEL, "closed named semaphore");
    }
}

impl<O: Ownership> Semaphore for NamedSemaphore<O> {
    fn wait(&self) -> io::Result<()> {
        unsafe { raw_wait(self.handle()?) }
    }

    fn try_wait(&self) -> io::Result<bool> {
        unsafe { raw_try_wait(self.handle()?) }
    }

    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        unsafe { raw_wait_timeout(self.handle()?, timeout) }
    }

    fn post(&self) -> io::Result<()> {
        unsafe { raw_post(self.handle()?) }
    }
}

impl<O: Ownership> Drop for NamedSemaphore<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedRegion;
    use std::time::Instant;

    fn test_name(label: &str) -> String {
        format!("/quartz_sem_{label}_{}", std::process::id())
    }

    #[test]
    fn named_post_then_wait() {
        let name = test_name("pw");
        let _ = NamedSemaphore::<Owner>::remove_stale(&name);

        let owner = NamedSemaphore::<Owner>::create(&name, 0).unwrap();
        let peer = NamedSemaphore::<Attached>::open(&name).unwrap();

        assert!(!peer.try_wait().unwrap());
        owner.post().unwrap();
        assert_eq!(peer.value().unwrap(), 1);
        peer.wait().unwrap();
        assert_eq!(owner.value().unwrap(), 0);
    }

    #[test]
    fn named_wait_timeout_expires_without_post() {
        let name = test_name("timeout");
        let _ = NamedSemaphore::<Owner>::remove_stale(&name);

        let sem = NamedSemaphore::<Owner>::create(&name, 0).unwrap();
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(50)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));

        sem.post().unwrap();
        assert!(sem.wait_for(Some(Duration::from_millis(50))).unwrap());
    }

    #[test]
    fn attached_close_keeps_name_owner_close_unlinks() {
        let name = test_name("close");
        let _ = NamedSemaphore::<Owner>::remove_stale(&name);

        let mut owner = NamedSemaphore::<Owner>::create(&name, 1).unwrap();
        let mut peer = NamedSemaphore::<Attached>::open(&name).unwrap();
        peer.close();
        peer.close();
        assert!(peer.is_closed());
        assert_eq!(peer.post().unwrap_err().kind(), io::ErrorKind::NotConnected);

        let _again = NamedSemaphore::<Attached>::open(&name).unwrap();

        owner.close();
        owner.close();
        assert!(NamedSemaphore::<Attached>::open(&name).is_err());
    }

    #[test]
    fn create_refuses_existing_name() {
        let name = test_name("excl");
        let _ = NamedSemaphore::<Owner>::remove_stale(&name);

        let _owner = NamedSemaphore::<Owner>::create(&name, 0).unwrap();
        let err = NamedSemaphore::<Owner>::create(&name, 0).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn embedded_semaphore_crosses_mappings() {
        let name = format!("/quartz_psem_{}", std::process::id());
        let _ = SharedRegion::<Owner>::remove_stale(&name);

        let mut owner = SharedRegion::<Owner>::create(&name, 4096).unwrap();
        let mut peer = SharedRegion::<crate::Attached>::open(&name).unwrap();

        let slot = owner.as_mut_ptr().unwrap() as *mut ProcessSemaphore;
        unsafe { ProcessSemaphore::init_at(slot, 1).unwrap() };

        let mine = unsafe { &*slot };
        let theirs = unsafe { &*(peer.as_mut_ptr().unwrap() as *const ProcessSemaphore) };

        assert!(theirs.try_wait().unwrap());
        assert!(!mine.try_wait().unwrap());
        assert!(!mine.wait_timeout(Duration::from_millis(20)).unwrap());

        let waiter = std::thread::spawn(move || {
            // Second thread, second mapping.
            let sem = unsafe { &*(peer.as_mut_ptr().unwrap() as *const ProcessSemaphore) };
            sem.wait().unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        mine.post().unwrap();
        waiter.join().unwrap();
        assert_eq!(mine.value().unwrap(), 0);
    }
}
