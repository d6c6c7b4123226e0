use quartz_chunk::Chunk;
use quartz_transport::{ShmEndpoint, Transport};
use std::thread::{self, JoinHandle};

/// Chunk sizes every bench sweeps.
pub const CHUNK_SIZES: [usize; 4] = [4 * 1024, 64 * 1024, 1024 * 1024, 4 * 1024 * 1024];

pub fn temp_shm_name(label: &str) -> String {
    let pid = std::process::id();
    format!("/quartz_bench_{label}_{pid}")
}

/// Endpoint whose transfer never runs out; benches end it with `finish`.
pub fn bench_endpoint(label: &str, chunk_size: usize) -> ShmEndpoint {
    ShmEndpoint::new(&temp_shm_name(label), chunk_size, u64::MAX)
}

/// Opens the sender here and a receiver on a thread that drains until end of
/// stream, returning the bytes it saw.
pub fn open_pair<T>(ep: &ShmEndpoint) -> (T, JoinHandle<u64>)
where
    T: Transport<Endpoint = ShmEndpoint> + Send + 'static,
{
    let tx = T::open_as_sender(ep).expect("failed to open sender");
    let ep = ep.clone();
    let rx = thread::spawn(move || {
        let mut rx = T::open_as_receiver(&ep).expect("failed to open receiver");
        let mut chunk = Chunk::zeroed(ep.chunk_size);
        let mut bytes = 0u64;
        while let Some(cycle) = rx.recv_chunk(&mut chunk).expect("receive failed") {
            bytes += cycle.bytes as u64;
        }
        rx.close();
        bytes
    });
    (tx, rx)
}

/// Ends the stream and waits for the receiver thread.
pub fn close_pair<T: Transport>(mut tx: T, rx: JoinHandle<u64>) -> u64 {
    tx.finish().expect("failed to send end of stream");
    let bytes = rx.join().expect("receiver panicked");
    tx.close();
    bytes
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{} KiB", bytes / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_sizes() {
        assert_eq!(format_bytes(4096), "4 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4 MiB");
        assert_eq!(format_bytes(12), "12 B");
    }

    #[test]
    fn shm_names_are_per_process() {
        let name = temp_shm_name("x");
        assert!(name.starts_with("/quartz_bench_x_"));
        assert!(name.ends_with(&std::process::id().to_string()));
    }
}
