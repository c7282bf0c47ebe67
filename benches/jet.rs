//! Jet evaluation benchmarks.
//!
//! Compares a JIT-compiled Taylor jet against a hand-written Rust
//! implementation of the same recurrences, and measures adaptive stepping
//! throughput. Compilation time is excluded from the evaluation benchmarks;
//! it is measured separately.

use criterion::{criterion_group, criterion_main, Criterion};
use taylor_jit::prelude::*;
use taylor_jit::JitState;

const ORDER: u32 = 20;

fn oscillator() -> Vec<(taylor_jit::Expression, taylor_jit::Expression)> {
    let x = var("x");
    let v = var("v");
    vec![
        (x.clone(), v.clone()),
        (v.clone(), num(-1.0) * x.clone()),
    ]
}

// The oscillator recurrences written out by hand, as the baseline.
fn direct_jet(x0: f64, v0: f64) -> ([f64; ORDER as usize + 1], [f64; ORDER as usize + 1]) {
    let mut cx = [0.0; ORDER as usize + 1];
    let mut cv = [0.0; ORDER as usize + 1];
    cx[0] = x0;
    cv[0] = v0;
    for n in 1..=ORDER as usize {
        cx[n] = cv[n - 1] / n as f64;
        cv[n] = -cx[n - 1] / n as f64;
    }
    (cx, cv)
}

fn benchmark_jet_evaluation(c: &mut Criterion) {
    let sys = oscillator();

    let mut group = c.benchmark_group("jet_evaluation");

    for (label, compact) in [("unrolled", false), ("compact", true)] {
        let mut state = JitState::new().unwrap();
        let dims = state
            .add_taylor_jet::<f64>("bench", &sys, ORDER, 1, compact)
            .unwrap();
        state.compile().unwrap();
        let jet = state.fetch_jet::<f64>("bench").unwrap();
        let mut tape = vec![0.0f64; dims.tape_len()];

        group.bench_function(label, |b| {
            b.iter(|| {
                tape[0] = 1.0;
                tape[1] = 0.5;
                jet.call(&mut tape, &[], &[0.0]).unwrap();
                std::hint::black_box(tape[dims.n_u as usize]);
            })
        });
    }

    group.bench_function("direct", |b| {
        b.iter(|| {
            let (cx, _) = direct_jet(std::hint::black_box(1.0), std::hint::black_box(0.5));
            std::hint::black_box(cx[1]);
        })
    });

    group.finish();
}

fn benchmark_stepping(c: &mut Criterion) {
    let sys = oscillator();
    let mut stepper =
        AdaptiveStepper::new(&sys, vec![1.0f64, 0.0], StepperOptions::default()).unwrap();

    c.bench_function("adaptive_step", |b| {
        b.iter(|| {
            stepper.step_forward().unwrap();
        })
    });
}

fn benchmark_compilation(c: &mut Criterion) {
    let sys = oscillator();

    c.bench_function("jet_compilation", |b| {
        b.iter(|| {
            let mut state = JitState::new().unwrap();
            state
                .add_taylor_jet::<f64>("bench", &sys, ORDER, 1, false)
                .unwrap();
            state.compile().unwrap();
            std::hint::black_box(state.fetch_jet::<f64>("bench").unwrap().dims());
        })
    });
}

criterion_group!(
    benches,
    benchmark_jet_evaluation,
    benchmark_stepping,
    benchmark_compilation
);
criterion_main!(benches);
