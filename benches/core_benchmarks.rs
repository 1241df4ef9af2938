//! 核心功能性能基准测试

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures_util::stream;
use transport_trace::body_clone::clone_body;
use transport_trace::envelope::Envelope;
use transport_trace::logging::truncate_body;
use transport_trace::response::ResponseCode;
use transport_trace::traceparent::{self, TraceContext};
use transport_trace::{CallContext, TraceId};

const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

/// 基准测试：ID 与上下文生成
fn bench_id_generation(c: &mut Criterion) {
    c.bench_function("TraceId::new", |b| {
        b.iter(|| black_box(TraceId::new()));
    });
    c.bench_function("CallContext::child", |b| {
        let root = CallContext::new_root().with_user_id("u-1");
        b.iter(|| black_box(root.child()));
    });
}

/// 基准测试：traceparent 解析与格式化
fn bench_traceparent(c: &mut Criterion) {
    let mut group = c.benchmark_group("traceparent");

    group.bench_function("parse_valid", |b| {
        b.iter(|| black_box(traceparent::parse(black_box(SAMPLE))));
    });

    // 格式错误时退化为全零ID，会多一次 warn 事件
    group.bench_function("parse_invalid", |b| {
        b.iter(|| black_box(traceparent::parse(black_box("00-xyz-abc-01"))));
    });

    let ctx = TraceContext::from_traceparent(SAMPLE);
    group.bench_function("format", |b| {
        b.iter(|| black_box(ctx.traceparent()));
    });

    group.finish();
}

/// 基准测试：载荷截断与信封渲染
fn bench_payload(c: &mut Criterion) {
    let body = vec![b'x'; 256 * 1024];
    c.bench_function("truncate_body/256KiB_to_64KiB", |b| {
        b.iter(|| black_box(truncate_body(black_box(&body), 64 * 1024)));
    });

    let envelope = Envelope::new(ResponseCode::SUCCESS, None);
    let data = br#"{"items":[1,2,3],"total":3}"#;
    c.bench_function("Envelope::wrap_bytes", |b| {
        b.iter(|| black_box(envelope.wrap_bytes(black_box(data))));
    });
}

/// 基准测试：内存中的消息体克隆
fn bench_body_clone(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let payload = Bytes::from(vec![b'x'; 16 * 1024]);
    let trace = TraceContext::new_root();

    c.bench_function("clone_body/16KiB", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let chunks = stream::iter(vec![Ok::<_, std::io::Error>(payload.clone())]);
                let clone = clone_body(Some(payload.len() as u64), 64 * 1024, &trace, chunks)
                    .await
                    .unwrap();
                black_box(clone.content_length)
            })
        });
    });
}

// 注册基准测试组
criterion_group!(
    benches,
    bench_id_generation,
    bench_traceparent,
    bench_payload,
    bench_body_clone
);

// 运行基准测试
criterion_main!(benches);
