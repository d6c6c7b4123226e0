//! Handshake cycles with the receiver on a second thread. Each iteration is a
//! full write, notify, read and acknowledge round.

use criterion::{Criterion, criterion_group, criterion_main};

#[cfg(target_os = "linux")]
fn bench_cycle(c: &mut Criterion) {
    use criterion::{BenchmarkId, Throughput, black_box};
    use quartz_chunk::Chunk;
    use quartz_perf::{CHUNK_SIZES, bench_endpoint, close_pair, format_bytes, open_pair};
    use quartz_transport::{HandshakeTransport, Transport};

    let mut group = c.benchmark_group("handshake");
    for size in CHUNK_SIZES {
        let ep = bench_endpoint(&format!("hs_{size}"), size);
        let (mut tx, rx) = open_pair::<HandshakeTransport>(&ep);
        let chunk = Chunk::filled(size, b'A');

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::from_parameter(format_bytes(size as u64)), |b| {
            b.iter(|| black_box(tx.send_chunk(chunk.as_slice()).expect("send failed")));
        });

        close_pair(tx, rx);
    }
    group.finish();
}

#[cfg(not(target_os = "linux"))]
fn bench_cycle(_c: &mut Criterion) {
    eprintln!("handshake needs process-shared unnamed semaphores, skipping");
}

criterion_group!(benches, bench_cycle);
criterion_main!(benches);
