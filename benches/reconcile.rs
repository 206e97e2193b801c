//! Reconcile benchmark: exact copy vs keyed max blending into a response buffer.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use serde_json::json;
use ueba_agent::inference::{blend_max, reconcile};
use ueba_agent::messages::{inference_batches, AeMessage, MessageMeta, MultiMessage, ResponseMemory};
use ueba_agent::model::{ReconstructionModel, ScoredBatch};
use ueba_agent::table::{Column, Table};

const ROWS: usize = 1024;

fn meta() -> MessageMeta {
    let table = Table::with_index(
        (0..ROWS as i64).collect(),
        vec![Column::new("v", (0..ROWS).map(|i| json!(i)).collect())],
    )
    .unwrap();
    MessageMeta::new("bench", table)
}

fn bench_exact(c: &mut Criterion) {
    let msg = AeMessage::<ReconstructionModel>::new(MultiMessage::new(meta()), None, None);
    let batches = inference_batches(&msg, ROWS);
    let scored = ScoredBatch {
        probs: Array2::from_elem((ROWS, 2), 0.5),
        row_keys: None,
        explain: Vec::new(),
    };
    c.bench_function("reconcile_exact_1024", |b| {
        b.iter(|| {
            let mut memory = ResponseMemory::new(ROWS);
            let mut batch = batches[0].clone();
            reconcile(&mut memory, &mut batch, black_box(&scored)).unwrap();
            black_box(memory)
        })
    });
}

fn bench_blend(c: &mut Criterion) {
    let groups = ROWS / 8;
    let outputs = Array2::from_shape_fn((groups, 2), |(i, j)| (i + j) as f32);
    let keys: Vec<usize> = (0..ROWS).map(|i| i / 8).collect();
    c.bench_function("blend_max_1024_rows_128_groups", |b| {
        b.iter(|| {
            let mut target = Array2::from_elem((ROWS, 2), f32::NAN);
            blend_max(target.view_mut(), outputs.view(), black_box(&keys));
            black_box(target)
        })
    });
}

criterion_group!(benches, bench_exact, bench_blend);
criterion_main!(benches);
