//! Protocol encoding/decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use repe_protocol::{BodyCodecs, BodyFormat, Header, Message};
use repe_uniudp::PacketHeader;
use serde_json::json;

fn create_test_message(payload_size: usize) -> Message {
    let codecs = BodyCodecs::new();
    Message::request(1, "/apply")
        .with_value(
            &json!({"data": "x".repeat(payload_size)}),
            BodyFormat::Json,
            &codecs,
        )
        .unwrap()
}

fn bench_header_encode(c: &mut Criterion) {
    let header = Header::new(42);
    c.bench_function("header_encode", |b| {
        b.iter(|| {
            let mut buf = bytes::BytesMut::with_capacity(48);
            header.encode(&mut buf);
            black_box(buf)
        });
    });
}

fn bench_header_decode(c: &mut Criterion) {
    let mut buf = bytes::BytesMut::with_capacity(48);
    Header::new(42).encode(&mut buf);
    c.bench_function("header_decode", |b| {
        b.iter(|| black_box(Header::decode(&buf).unwrap()));
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");

    for size in [100, 1000, 10000] {
        let msg = create_test_message(size);

        group.throughput(Throughput::Bytes(msg.header.length));
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| black_box(msg.encode()));
        });
    }

    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");

    for size in [100, 1000, 10000] {
        let encoded = create_test_message(size).encode();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(Message::decode(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_packet_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_pack");

    for size in [64usize, 512, 1400] {
        let payload = vec![0x42u8; size];
        let header = PacketHeader {
            message_id: 7,
            chunk_index: 0,
            total_chunks: 1,
            message_length: size as u32,
            chunk_size: size as u16,
            payload_len: size as u16,
            redundancy: 1,
            attempt: 1,
            fec_group_size: 1,
            parity: false,
        };

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(header.pack(payload)));
        });
    }

    group.finish();
}

fn bench_packet_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_parse");

    for size in [64usize, 512, 1400] {
        let payload = vec![0x42u8; size];
        let header = PacketHeader {
            message_id: 7,
            chunk_index: 0,
            total_chunks: 1,
            message_length: size as u32,
            chunk_size: size as u16,
            payload_len: size as u16,
            redundancy: 1,
            attempt: 1,
            fec_group_size: 1,
            parity: false,
        };
        let packed = header.pack(&payload);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &packed, |b, packed| {
            b.iter(|| black_box(PacketHeader::parse(packed).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode,
    bench_message_encode,
    bench_message_decode,
    bench_packet_pack,
    bench_packet_parse,
);

criterion_main!(benches);
