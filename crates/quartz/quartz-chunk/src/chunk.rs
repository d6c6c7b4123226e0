// Chunk: the unit of transfer
//
// A chunk is an opaque, fixed-capacity byte buffer. Every transport moves
// exactly one chunk per cycle. Capacity is chosen once per run (chunk_size)
// and never changes; the number of valid bytes may be smaller on the final
// cycle when total_size is not a multiple of chunk_size.
//
// End of stream is an explicit 4-byte payload `DONE`. A data chunk can never be
// mistaken for it because configuration requires chunk_size > 4 and only the
// final chunk of a run may be shorter than chunk_size.

pub const MIB: usize = 1024 * 1024;

/// 16 MiB per cycle.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * MIB;

/// 10 GiB per run.
pub const DEFAULT_TOTAL_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Out-of-band end-of-stream marker.
pub const SENTINEL: &[u8; 4] = b"DONE";

/// True when `payload` is exactly the end-of-stream marker.
#[inline]
pub fn is_sentinel(payload: &[u8]) -> bool {
    payload.len() == SENTINEL.len() && payload == SENTINEL
}

/// Heap buffer of a fixed capacity, reused for every cycle of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    buf: Box<[u8]>,
}

impl Chunk {
    /// Chunk of `capacity` bytes, all set to `byte`.
    pub fn filled(capacity: usize, byte: u8) -> Self {
        Self {
            buf: vec![byte; capacity].into_boxed_slice(),
        }
    }

    pub fn zeroed(capacity: usize) -> Self {
        Self::filled(capacity, 0)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// First `len` bytes, clamped to capacity.
    #[inline]
    pub fn head(&self, len: usize) -> &[u8] {
        &self.buf[..len.min(self.buf.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_matches_only_exact_payload() {
        assert!(is_sentinel(b"DONE"));
        assert!(!is_sentinel(b"DONE\0"));
        assert!(!is_sentinel(b"DON"));
        assert!(!is_sentinel(b"done"));
        assert!(!is_sentinel(&[]));
    }

    #[test]
    fn data_chunk_spelling_done_is_not_a_sentinel() {
        // Full-size chunk that happens to start with the marker bytes.
        let mut chunk = Chunk::zeroed(1024);
        chunk.as_mut_slice()[..4].copy_from_slice(SENTINEL);
        assert!(!is_sentinel(chunk.as_slice()));
        assert!(is_sentinel(chunk.head(4)));
    }

    #[test]
    fn filled_chunk_has_requested_capacity_and_content() {
        let chunk = Chunk::filled(4096, b'A');
        assert_eq!(chunk.capacity(), 4096);
        assert!(chunk.as_slice().iter().all(|&b| b == b'A'));
        assert_eq!(chunk.head(10_000).len(), 4096);
    }

    #[test]
    fn defaults_match_reference_workload() {
        assert_eq!(DEFAULT_CHUNK_SIZE, 16_777_216);
        assert_eq!(DEFAULT_TOTAL_SIZE % DEFAULT_CHUNK_SIZE as u64, 0);
        assert_eq!(DEFAULT_TOTAL_SIZE / DEFAULT_CHUNK_SIZE as u64, 640);
    }
}
