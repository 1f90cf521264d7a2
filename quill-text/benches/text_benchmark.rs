use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use quill_text::codec::{decode_delta, encode_delta};
use quill_text::{ReplicaId, TextDoc};
use std::hint::black_box;

fn typed_doc(replica: u64, chars: usize) -> TextDoc {
    let mut doc = TextDoc::new(ReplicaId(replica));
    for i in 0..chars {
        let ch = (b'a' + (i % 26) as u8) as char;
        doc.insert(i, &ch.to_string()).unwrap();
    }
    doc
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append_keystroke_1k_doc", |b| {
        let mut doc = typed_doc(1, 1_000);
        b.iter(|| {
            let len = doc.len();
            let delta = doc.insert(len, black_box("x")).unwrap();
            black_box(delta);
        })
    });

    group.bench_function("materialize_1k", |b| {
        let doc = typed_doc(1, 1_000);
        b.iter(|| black_box(doc.materialize()))
    });

    group.finish();
}

fn bench_remote_integration(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");

    let source = typed_doc(1, 1_000);
    let full = source.encode_state();
    group.throughput(Throughput::Elements(full.items.len() as u64));

    group.bench_function("integrate_full_state_1k", |b| {
        b.iter(|| {
            let mut dest = TextDoc::new(ReplicaId(2));
            black_box(dest.integrate(black_box(&full)));
        })
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Update Codec");

    let mut doc = TextDoc::new(ReplicaId(1));
    let keystroke = doc.insert(0, "k").unwrap();
    let snapshot = typed_doc(3, 1_000).encode_state();
    let snapshot_bytes = encode_delta(&snapshot).unwrap();

    group.bench_function("encode_keystroke", |b| {
        b.iter(|| black_box(encode_delta(black_box(&keystroke)).unwrap()))
    });

    group.bench_function("decode_snapshot_1k", |b| {
        b.iter(|| black_box(decode_delta(black_box(&snapshot_bytes)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_local_typing, bench_remote_integration, bench_codec);
criterion_main!(benches);
