use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use courier_events::{BoundedQueue, InMemoryStream, StreamTransport};
use std::thread;
use std::time::Duration;

/// Single producer, single consumer through a bounded queue.
fn bench_queue_spsc(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue_spsc");

    for capacity in [1usize, 16, 100, 1024].iter() {
        let messages = 10_000u64;
        group.throughput(Throughput::Elements(messages));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            capacity,
            |b, &capacity| {
                b.iter(|| {
                    let queue = BoundedQueue::arc(capacity);
                    let consumer = {
                        let queue = queue.clone();
                        thread::spawn(move || {
                            let mut sum = 0u64;
                            for v in queue.iter() {
                                sum += v;
                            }
                            sum
                        })
                    };
                    for i in 0..messages {
                        queue.send(black_box(i)).unwrap();
                    }
                    queue.close();
                    black_box(consumer.join().unwrap())
                });
            },
        );
    }

    group.finish();
}

/// Re-submission cost on the worker side (recv + requeue).
fn bench_queue_requeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue_requeue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("recv_then_requeue", |b| {
        let queue = BoundedQueue::new(100);
        for i in 0..100u32 {
            queue.send(i).unwrap();
        }
        b.iter(|| {
            let v = queue.recv().unwrap();
            queue.requeue(black_box(v)).unwrap();
        });
    });

    group.finish();
}

/// Publish + read + ack through the in-memory stream.
fn bench_memory_stream_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_stream");
    group.throughput(Throughput::Elements(1));

    group.bench_function("publish_read_ack", |b| {
        let stream = InMemoryStream::new();
        let mut sub = stream.subscribe("bench", "g", "c").unwrap();
        b.iter(|| {
            stream.publish("bench", black_box(b"TCK-1")).unwrap();
            let delivery = sub.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
            delivery.ack().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_spsc,
    bench_queue_requeue,
    bench_memory_stream_roundtrip
);
criterion_main!(benches);
