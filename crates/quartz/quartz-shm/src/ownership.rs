/// Release policy of a shared OS resource.
pub trait Ownership {
    /// Whether releasing the handle also removes the name from the system.
    const UNLINK_ON_RELEASE: bool;
    const LABEL: &'static str;
}

/// Handle held by the process that created the resource. Releasing it unmaps
/// or closes the resource and unlinks its name.
#[derive(Debug)]
pub struct Owner;

impl Ownership for Owner {
    const UNLINK_ON_RELEASE: bool = true;
    const LABEL: &'static str = "owner";
}

/// Handle held by a process that opened an existing resource. Releasing it only
/// unmaps or closes; the name stays for the owner to remove.
#[derive(Debug)]
pub struct Attached;

impl Ownership for Attached {
    const UNLINK_ON_RELEASE: bool = false;
    const LABEL: &'static str = "attached";
}
