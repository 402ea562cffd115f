//! Performance benchmarks for output and message processing.
//!
//! These benchmarks measure the hot paths in the gateway:
//! - Escape sequence sanitization of PTY output
//! - UTF-8 decoding of output chunks
//! - Inbound message decoding and outbound encoding

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use gateway::sanitize::sanitize;
use gateway::session::Utf8Decoder;
use protocol::{decode_client_message, ServerMessage};

/// A colored `ls`-style line, repeated to fill a read buffer.
fn colored_output(size: usize) -> Vec<u8> {
    let line = b"\x1b[01;34mdirectory\x1b[0m  \x1b[01;32mscript.sh\x1b[0m  notes.txt\r\n";
    line.iter().copied().cycle().take(size).collect()
}

/// Benchmark sanitization of PTY output.
fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitize");

    // Plain text with no escapes
    let plain = b"hello world\r\n".repeat(315);
    group.throughput(Throughput::Bytes(plain.len() as u64));
    group.bench_function("plain_4KB", |b| {
        b.iter(|| sanitize(black_box(&plain)));
    });

    // Typical colored output chunk
    let colored = colored_output(4096);
    group.throughput(Throughput::Bytes(colored.len() as u64));
    group.bench_function("colored_4KB", |b| {
        b.iter(|| sanitize(black_box(&colored)));
    });

    // Full-screen redraw
    let redraw = {
        let mut buf = b"\x1b[?2004l\x1b[H\x1b[2J".to_vec();
        for row in 1..=50 {
            buf.extend_from_slice(format!("\x1b[{row};1H\x1b[K").as_bytes());
            buf.extend_from_slice(&colored_output(120));
        }
        buf
    };
    group.throughput(Throughput::Bytes(redraw.len() as u64));
    group.bench_function("screen_redraw", |b| {
        b.iter(|| sanitize(black_box(&redraw)));
    });

    group.finish();
}

/// Benchmark UTF-8 decoding across chunk boundaries.
fn bench_utf8_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_decoding");

    let text = "héllo wörld ☃ ".repeat(256);
    let bytes = text.as_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("whole_chunk", |b| {
        let mut decoder = Utf8Decoder::default();
        b.iter(|| decoder.decode(black_box(bytes)));
    });

    // Split mid-character every time
    group.bench_function("split_chunks", |b| {
        let mut decoder = Utf8Decoder::default();
        b.iter(|| {
            let mut out = decoder.decode(black_box(&bytes[..1001]));
            out.push_str(&decoder.decode(black_box(&bytes[1001..])));
            out
        });
    });

    group.finish();
}

/// Benchmark protocol message handling.
fn bench_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("messages");

    group.bench_function("decode_input_keystroke", |b| {
        let json = r#"{"type":"input","data":"l"}"#;
        b.iter(|| decode_client_message(black_box(json)).unwrap());
    });

    group.bench_function("decode_resize", |b| {
        let json = r#"{"type":"resize","rows":40,"cols":120}"#;
        b.iter(|| decode_client_message(black_box(json)).unwrap());
    });

    group.bench_function("decode_malformed", |b| {
        let json = r#"{"type":"unknown"}"#;
        b.iter(|| decode_client_message(black_box(json)).unwrap_err());
    });

    let output = ServerMessage::output(String::from_utf8_lossy(&colored_output(4096)));
    group.bench_function("encode_output_4KB", |b| {
        b.iter(|| black_box(&output).to_json().unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_sanitize, bench_utf8_decoding, bench_messages);

criterion_main!(benches);
