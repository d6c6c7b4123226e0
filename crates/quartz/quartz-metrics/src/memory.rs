// ─── Resident Memory ────────────────────────────────────────────────────────

/// Memory in mebibytes as a float, the unit of the `rss_mb` column.
pub type MegabytesF64 = f64;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Current resident set size of this process.
///
/// On Linux this reads `/proc/self/statm`, so it can go down as well as up. If
/// that fails, or on other platforms, it falls back to the peak reported by
/// `getrusage`.
pub fn sample_resident_memory() -> MegabytesF64 {
    #[cfg(target_os = "linux")]
    if let Some(bytes) = statm_resident_bytes() {
        return bytes as f64 / BYTES_PER_MB;
    }
    rusage_max_rss_bytes() as f64 / BYTES_PER_MB
}

#[cfg(target_os = "linux")]
fn statm_resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return None;
    }
    Some(resident_pages * page as u64)
}

fn rusage_max_rss_bytes() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return 0;
    }
    // Kilobytes on Linux, bytes on macOS.
    #[cfg(target_os = "linux")]
    let bytes = usage.ru_maxrss * 1024;
    #[cfg(not(target_os = "linux"))]
    let bytes = usage.ru_maxrss;
    bytes.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resident_memory_is_positive() {
        assert!(sample_resident_memory() > 0.0);
    }

    #[test]
    fn touching_memory_raises_the_sample() {
        let before = sample_resident_memory();
        let mut block = vec![0u8; 64 * 1024 * 1024];
        for page in block.chunks_mut(4096) {
            page[0] = 1;
        }
        let after = sample_resident_memory();
        assert!(after >= before + 32.0, "before {before} after {after}");
        std::hint::black_box(&block);
    }
}
