use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use livecast::audio::{AudioFeed, RingBuffer, StereoRing};

fn ring_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_write_read");
    for block in [64usize, 256, 1024] {
        let ring = RingBuffer::<f32>::new(block * 8);
        let input = vec![0.5f32; block];
        let mut output = vec![0.0f32; block];
        group.throughput(Throughput::Elements(block as u64));
        group.bench_with_input(BenchmarkId::from_parameter(block), &block, |b, _| {
            b.iter(|| {
                ring.write(black_box(&input));
                ring.read(black_box(&mut output));
            })
        });
    }
    group.finish();
}

fn stereo_write(c: &mut Criterion) {
    let ring = StereoRing::new(44100);
    let left = vec![0.25f32; 512];
    let right = vec![-0.25f32; 512];
    c.bench_function("stereo_write_512", |b| {
        b.iter(|| {
            ring.write(black_box(&left), black_box(&right));
            ring.clear();
        })
    });
}

fn feed_fan_in(c: &mut Criterion) {
    let mut feed = AudioFeed::new(44100);
    let sinks: Vec<_> = (0..6).map(|_| feed.add_sink(53000)).collect();
    for sink in &sinks {
        sink.enable();
    }
    let left = vec![0.1f32; 256];
    let right = vec![0.1f32; 256];
    c.bench_function("feed_process_6_sinks", |b| {
        b.iter(|| {
            feed.process(black_box(&left), black_box(&right));
            for sink in &sinks {
                sink.ring().clear();
            }
        })
    });
}

criterion_group!(benches, ring_write_read, stereo_write, feed_fan_in);
criterion_main!(benches);
