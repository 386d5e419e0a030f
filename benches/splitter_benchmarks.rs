/// 分割器性能基准测试
///
/// 对比：
/// 1. 不同协议分割器在同一负载上的判定开销
/// 2. 粘包场景下整段判定 vs 逐步补齐
/// 3. 不同帧大小对 WebSocket 头解析的影响

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use evsock::buffer::ByteAccumulator;
use evsock::session::SessionHandle;
use evsock::{
    FixedLengthSplitter, HttpSplitter, LineSplitter, MessageSplitter, SplitResult,
    WebSocketSplitter,
};

fn accumulate(data: &[u8]) -> ByteAccumulator {
    let mut acc = ByteAccumulator::new(data.len().max(1) * 2);
    acc.append(data).expect("fits the limit");
    acc
}

fn websocket_frame(payload_len: usize) -> Vec<u8> {
    let mut frame = vec![0x82u8];
    if payload_len < 126 {
        frame.push(payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }
    frame.extend(std::iter::repeat(0xAB).take(payload_len));
    frame
}

fn bench_line_splitter(c: &mut Criterion) {
    let session = SessionHandle::detached();
    let splitter = LineSplitter;
    let mut group = c.benchmark_group("line_splitter");

    for &size in &[64usize, 1024, 16 * 1024] {
        let mut data = vec![b'x'; size - 1];
        data.push(b'\n');
        let acc = accumulate(&data);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &acc, |b, acc| {
            b.iter(|| {
                let result = splitter.can_split(black_box(&session), black_box(acc));
                assert_eq!(result, SplitResult::Frame(size));
            })
        });
    }
    group.finish();
}

fn bench_fixed_splitter(c: &mut Criterion) {
    let session = SessionHandle::detached();
    let splitter = FixedLengthSplitter::new(1024);
    let acc = accumulate(&vec![0u8; 4096]);

    c.bench_function("fixed_splitter_1k_of_4k", |b| {
        b.iter(|| {
            let result = splitter.can_split(black_box(&session), black_box(&acc));
            assert_eq!(result, SplitResult::Frame(1024));
        })
    });
}

fn bench_websocket_header_parse(c: &mut Criterion) {
    let session = SessionHandle::detached();
    let splitter = WebSocketSplitter;
    let mut group = c.benchmark_group("websocket_splitter");

    for &payload in &[32usize, 4096, 128 * 1024] {
        let frame = websocket_frame(payload);
        let acc = accumulate(&frame);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(payload), &acc, |b, acc| {
            b.iter(|| {
                let result = splitter.can_split(black_box(&session), black_box(acc));
                assert!(matches!(result, SplitResult::Frame(_)));
            })
        });
    }
    group.finish();
}

fn bench_http_request_parse(c: &mut Criterion) {
    let session = SessionHandle::detached();
    let splitter = HttpSplitter;
    let body = "z".repeat(512);
    let request = format!(
        "POST /submit HTTP/1.1\r\nHost: bench.local\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let acc = accumulate(request.as_bytes());

    c.bench_function("http_splitter_post_512b_body", |b| {
        b.iter(|| {
            let result = splitter.can_split(black_box(&session), black_box(&acc));
            assert_eq!(result, SplitResult::Frame(request.len()));
        })
    });
}

/// 粘包场景: 一个缓冲里塞了多帧, 模拟分帧循环里的反复判定
fn bench_coalesced_frames(c: &mut Criterion) {
    let session = SessionHandle::detached();
    let splitter = LineSplitter;
    let mut data = Vec::new();
    for i in 0..64 {
        data.extend_from_slice(format!("message-{}\n", i).as_bytes());
    }

    c.bench_function("line_splitter_64_coalesced_frames", |b| {
        b.iter(|| {
            let mut acc = accumulate(black_box(&data));
            let mut frames = 0;
            while let SplitResult::Frame(length) = splitter.can_split(&session, &acc) {
                acc.consume(length);
                frames += 1;
            }
            assert_eq!(frames, 64);
        })
    });
}

criterion_group!(
    benches,
    bench_line_splitter,
    bench_fixed_splitter,
    bench_websocket_header_parse,
    bench_http_request_parse,
    bench_coalesced_frames
);
criterion_main!(benches);
