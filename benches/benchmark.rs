use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use keisan::calc::{CalculatorFactory, SimpleCalculatorFactory, UnitTable};
use keisan::evaluator::{EvalState, SectionEvaluator, SectionOutcome};
use keisan::fiber::StepOutcome;
use keisan::section::SectionId;

fn section_inputs(lines: usize) -> Vec<String> {
    (0..lines).map(|n| format!("{} + {}", n, n)).collect()
}

/// Drives the step function to completion, the way the scheduler does one
/// fiber, without budget pauses.
fn evaluate(evaluator: &SectionEvaluator, mut state: EvalState) -> SectionOutcome {
    loop {
        match evaluator.step(state) {
            StepOutcome::Continue(next) => state = next,
            StepOutcome::Done(outcome) => return outcome,
        }
    }
}

fn bench_cold_section(c: &mut Criterion) {
    let factory = SimpleCalculatorFactory;
    let units = UnitTable::new();
    let evaluator = SectionEvaluator::new(32);
    let inputs = section_inputs(100);

    c.bench_function("evaluate 100 lines cold", |b| {
        b.iter_batched(
            || {
                EvalState::new(
                    SectionId::from("bench"),
                    factory.instance(&units),
                    Default::default(),
                    inputs.clone(),
                    Vec::new(),
                )
            },
            |state| evaluate(&evaluator, state),
            BatchSize::SmallInput,
        )
    });
}

fn bench_cached_section(c: &mut Criterion) {
    let factory = SimpleCalculatorFactory;
    let units = UnitTable::new();
    let evaluator = SectionEvaluator::new(32);
    let inputs = section_inputs(100);

    // 一度評価して前回結果を作っておく
    let calculator = factory.instance(&units);
    let warm = evaluate(
        &evaluator,
        EvalState::new(
            SectionId::from("bench"),
            calculator.clone(),
            Default::default(),
            inputs.clone(),
            Vec::new(),
        ),
    );

    c.bench_function("evaluate 100 lines cached", |b| {
        b.iter_batched(
            || {
                EvalState::new(
                    SectionId::from("bench"),
                    calculator.clone(),
                    warm.constants.clone(),
                    inputs.clone(),
                    warm.results.clone(),
                )
            },
            |state| evaluate(&evaluator, state),
            BatchSize::SmallInput,
        )
    });
}

// ベンチマークグループの定義
criterion_group!(benches, bench_cold_section, bench_cached_section);
criterion_main!(benches);
