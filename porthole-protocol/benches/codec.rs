//! Codec throughput benchmarks

#![allow(clippy::unwrap_used)]
#![allow(clippy::pedantic)]

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use porthole_protocol::codec::TunnelCodec;
use porthole_protocol::frame::Frame;
use porthole_protocol::types::MessageType;
use tokio_util::codec::{Decoder, Encoder};

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for size in [64usize, 4096, 65536] {
        let payload = Bytes::from(vec![0xABu8; size]);
        let frame = Frame::stream(MessageType::StreamData, 1, payload);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}"), |b| {
            let mut codec = TunnelCodec::new();
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(size + 16);
                codec.encode(black_box(frame.clone()), &mut buf).unwrap();
                black_box(buf);
            });
        });

        let mut encoded = BytesMut::new();
        TunnelCodec::new().encode(frame.clone(), &mut encoded).unwrap();
        let encoded = encoded.freeze();

        group.bench_function(format!("decode_{size}"), |b| {
            let mut codec = TunnelCodec::new();
            b.iter(|| {
                let mut buf = BytesMut::from(encoded.as_ref());
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
