//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Output buffering for replay
//! - Viewer message encoding (JSON text and MessagePack)
//! - Viewer message decoding

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::protocol::{
    decode_binary, decode_text, encode_binary, ClientMessage, ServerMessage, TextEncoder,
};
use daemon::session::OutputBuffer;

fn output(len: usize) -> ServerMessage {
    ServerMessage::Output {
        session_id: "3f2c9a1e-0000-4000-8000-000000000000".to_string(),
        data: b"ls -la\r\n".iter().copied().cycle().take(len).collect(),
    }
}

/// Benchmark appending terminal output to the replay buffer.
fn bench_output_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_buffer");

    for (name, len) in [("push_64B", 64usize), ("push_4KB", 4096), ("push_64KB", 65536)] {
        let chunk = vec![b'x'; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(name, |b| {
            let mut buffer = OutputBuffer::new(50_000);
            b.iter(|| buffer.push(black_box(&chunk)));
        });
    }

    group.bench_function("snapshot_full", |b| {
        let mut buffer = OutputBuffer::new(50_000);
        buffer.push(&vec![b'y'; 60_000]);
        b.iter(|| black_box(buffer.snapshot()));
    });

    group.finish();
}

/// Benchmark encoding output for viewers.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (name, len) in [("small_1B", 1usize), ("medium_4KB", 4096), ("large_64KB", 65536)] {
        let message = output(len);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(format!("text_{}", name), |b| {
            let mut encoder = TextEncoder::new();
            b.iter(|| encoder.encode(black_box(message.clone())).unwrap());
        });

        group.bench_function(format!("binary_{}", name), |b| {
            b.iter(|| encode_binary(black_box(&message)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark decoding viewer input.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let text = r#"{"type":"input","sessionId":"3f2c9a1e-0000-4000-8000-000000000000","data":"a"}"#;
    group.bench_function("text_keystroke", |b| {
        b.iter(|| decode_text(black_box(text)).unwrap());
    });

    let binary = rmp_serde::to_vec_named(&ClientMessage::Input {
        session_id: "3f2c9a1e-0000-4000-8000-000000000000".to_string(),
        data: b"a".to_vec(),
    })
    .unwrap();
    group.bench_function("binary_keystroke", |b| {
        b.iter(|| decode_binary(black_box(&binary)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_output_buffer, bench_encode, bench_decode);
criterion_main!(benches);
