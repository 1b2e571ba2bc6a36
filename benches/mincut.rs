//! Minimum cut and leakage benchmarks.
//!
//! Workload: ripple-carry adder chains `h + l + l + ...` whose dependency graphs grow with
//! the bit width and the chain length.
//!
//! Run with:
//! ```bash
//! cargo bench --bench mincut
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use qif_rs::analysis::{analyze, Options};
use qif_rs::ast::{BinaryOp, Program, ProgramBuilder};
use qif_rs::lattice::Sec;
use qif_rs::mincut::{min_vertex_cut, INFTY};

/// `o = h + l + l + ... + l` (`length` additions) for `width`-bit inputs.
fn adder_chain(width: usize, length: usize) -> Program {
    let unknown = format!("0b{}", "u".repeat(width));
    let mut b = ProgramBuilder::new();
    let h = b.declare("h");
    let l = b.declare("l");
    let o = b.declare("o");
    let secret = b.input(h, Sec::H, &unknown).expect("valid literal");
    let public = b.input(l, Sec::L, &unknown).expect("valid literal");
    let mut acc = b.var(h);
    for _ in 0..length {
        let y = b.var(l);
        acc = b.binary(BinaryOp::Add, acc, y);
    }
    let output = b.output(o, Sec::L, acc);
    b.finish(vec![secret, public, output])
}

fn bench_leakage(c: &mut Criterion) {
    let mut group = c.benchmark_group("leakage");

    for &width in &[8usize, 16, 32] {
        let program = adder_chain(width, 4);
        let options = Options::default().with_bit_width(width);
        let result = analyze(&program, &options).expect("analysis succeeds");
        group.throughput(Throughput::Elements(result.context().arena().len() as u64));
        group.bench_with_input(BenchmarkId::new("adder_chain", width), &result, |b, result| {
            b.iter(|| result.leakage(Sec::L).expect("valid level"));
        });
    }

    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");

    for &length in &[1usize, 4, 16] {
        let program = adder_chain(16, length);
        let options = Options::default().with_bit_width(16);
        group.bench_with_input(BenchmarkId::new("adder_chain", length), &program, |b, program| {
            b.iter(|| analyze(program, &options).expect("analysis succeeds"));
        });
    }

    group.finish();
}

fn bench_grid(c: &mut Criterion) {
    let mut group = c.benchmark_group("mincut");

    // n x n grid, every node depending on its right and lower neighbours.
    for &n in &[8u32, 16, 32] {
        let deps = move |v: u32| {
            let (i, j) = (v / n, v % n);
            let mut next = Vec::with_capacity(2);
            if i + 1 < n {
                next.push(v + n);
            }
            if j + 1 < n {
                next.push(v + 1);
            }
            next
        };
        let sink = n * n - 1;
        let weight = move |v: u32| if v == 0 || v == sink { INFTY } else { 1 };
        group.throughput(Throughput::Elements(u64::from(n * n)));
        group.bench_function(BenchmarkId::new("grid", n), |b| {
            b.iter(|| min_vertex_cut(&[0], &[sink], deps, weight));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_leakage, bench_analysis, bench_grid);
criterion_main!(benches);
