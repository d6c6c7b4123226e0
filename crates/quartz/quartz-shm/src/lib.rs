//! POSIX shared-memory primitives shared by the sender and receiver processes.
//!
//! Every OS resource here has exactly one creator. The creating process holds
//! an [`Owner`] handle that unlinks the name when released; every other process
//! holds an [`Attached`] handle that can only unmap or close. The distinction is
//! carried in the type, so a receiver cannot destroy what it did not create.

mod ownership;
mod region;
mod semaphore;

pub use ownership::{Attached, Owner, Ownership};
pub use region::{SharedRegion, normalize_name};
pub use semaphore::{NamedSemaphore, ProcessSemaphore, Semaphore};
