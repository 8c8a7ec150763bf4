use criterion::{black_box, criterion_group, BenchmarkId, Criterion};
use st_schemas::coordinates::{lin_to_z, lin_to_z_naive};

fn bench_lin_to_z(c: &mut Criterion) {
    let idx = 0b101_11010_01101usize;
    c.bench_with_input(BenchmarkId::new("lin_to_z", idx), &idx, |b, &i| {
        b.iter(move || lin_to_z(black_box(i)))
    });
}

fn bench_lin_to_z_naive(c: &mut Criterion) {
    let idx = 0b101_11010_01101usize;
    c.bench_with_input(BenchmarkId::new("naive_lin_to_z", idx), &idx, |b, &i| {
        b.iter(move || lin_to_z_naive(black_box(i)))
    });
}

criterion_group!(zorder_benches, bench_lin_to_z, bench_lin_to_z_naive);
