//! # Section Evaluator
//!
//! The step function driven by the task runner. Each invocation serves any
//! number of unchanged lines from the previous results snapshot but performs
//! at most one expensive parse; when lines remain it requests continuation,
//! so a burst interleaves cheaply with other work.
//!
//! Once every line of a pass is evaluated, duplicate assignments are
//! shadowed (first one wins), and the pass's assignments are diffed against
//! the constants the pass ran with. Any difference restarts the whole
//! section from scratch against corrected constants; this fixed-point
//! iteration ends in a stable pass whose results, constants and folded
//! total become the section's outcome. Sections without assignment changes
//! stabilize in a single pass.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::calc::{CalcValue, Calculator, ConstantsMap};
use crate::fiber::StepOutcome;
use crate::section::{LineResult, SectionId, SectionTotal};

/// Transient state of one evaluation attempt. Exactly one exists at a time,
/// owned by the scheduler's fiber; dropping it cancels the attempt.
pub struct EvalState {
    pub section_id: SectionId,
    pub force_recalculation: bool,
    /// Fixed-point restarts performed so far.
    pub pass: u32,
    pub calculator: Arc<dyn Calculator>,
    pub constants: ConstantsMap,
    pub inputs: Vec<String>,
    /// Cache snapshot being consumed; hits are removed first-match-first.
    pub previous_results: Vec<LineResult>,
    pub results: Vec<LineResult>,
}

impl EvalState {
    pub fn new(
        section_id: SectionId,
        calculator: Arc<dyn Calculator>,
        constants: ConstantsMap,
        inputs: Vec<String>,
        previous_results: Vec<LineResult>,
    ) -> Self {
        Self {
            section_id,
            force_recalculation: false,
            pass: 0,
            calculator,
            constants,
            inputs,
            previous_results,
            results: Vec::new(),
        }
    }

    /// Fresh state for a from-scratch pass against corrected constants.
    /// The previous snapshot is dropped: its values were produced under
    /// bindings now known to be stale.
    fn recalculation(state: EvalState, constants: ConstantsMap) -> Self {
        Self {
            section_id: state.section_id,
            force_recalculation: true,
            pass: state.pass + 1,
            calculator: state.calculator,
            constants,
            inputs: state.inputs,
            previous_results: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Lines still to process in the current pass.
    pub fn remaining(&self) -> usize {
        self.inputs.len().saturating_sub(self.results.len())
    }
}

/// Completed stable (or capped) evaluation of one section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionOutcome {
    pub section_id: SectionId,
    pub results: Vec<LineResult>,
    pub constants: ConstantsMap,
    pub total: SectionTotal,
    /// False when the fixed point did not stabilize within the pass cap.
    pub converged: bool,
    /// Full passes executed, 1 for a section without assignment changes.
    pub passes: u32,
}

#[derive(Debug, Clone)]
pub struct SectionEvaluator {
    max_passes: u32,
}

impl SectionEvaluator {
    /// `max_passes` bounds the fixed-point iteration; clamped to at least 1.
    pub fn new(max_passes: u32) -> Self {
        Self {
            max_passes: max_passes.max(1),
        }
    }

    /// One step invocation: any number of cache hits, at most one parse.
    pub fn step(&self, mut state: EvalState) -> StepOutcome<EvalState, SectionOutcome> {
        let mut parsed_this_invocation = false;

        while state.results.len() < state.inputs.len() {
            let input = &state.inputs[state.results.len()];

            if let Some(index) = state
                .previous_results
                .iter()
                .position(|previous| previous.input == *input)
            {
                // 同一テキストの行はパースせずに前回の値を使い回す
                let previous = state.previous_results.remove(index);
                let value = previous.shadowed_assignment.or(previous.value);
                trace!(section_id = %state.section_id, input, "line served from cache");
                state.results.push(LineResult::new(input.clone(), value));
            } else if !parsed_this_invocation {
                let value = match state.calculator.parse(input, &state.constants) {
                    Ok(value) => value,
                    Err(error) => CalcValue::Error(error.to_string()),
                };
                parsed_this_invocation = true;
                state.results.push(LineResult::new(input.clone(), Some(value)));
            } else {
                // 1回の呼び出しでの高コストなパースは1つまで
                return StepOutcome::Continue(state);
            }
        }

        let results = shadow_duplicate_assignments(std::mem::take(&mut state.results));
        let new_or_changed = new_or_changed_assignments(&state.constants, &results);
        let removed = assignment_identifiers(&state.previous_results);

        if !new_or_changed.is_empty() || !removed.is_empty() {
            if state.pass + 1 < self.max_passes {
                debug!(
                    section_id = %state.section_id,
                    pass = state.pass + 1,
                    new_or_changed = new_or_changed.len(),
                    removed = removed.len(),
                    "assignments changed, recalculating from scratch"
                );
                let constants = next_constants(&state.constants, new_or_changed, &removed);
                return StepOutcome::Continue(EvalState::recalculation(state, constants));
            }
            // パス上限に達したので安定しないまま打ち切る
            return StepOutcome::Done(finish(state, results, false));
        }

        StepOutcome::Done(finish(state, results, true))
    }
}

fn finish(state: EvalState, results: Vec<LineResult>, converged: bool) -> SectionOutcome {
    let total = fold_total(state.calculator.as_ref(), &results);
    SectionOutcome {
        section_id: state.section_id,
        results,
        constants: state.constants,
        total,
        converged,
        passes: state.pass + 1,
    }
}

/// Folds all non-null, non-assignment, non-error values left-to-right
/// through the calculator's addition, then formats the result. No summable
/// values yields the conspicuous empty total.
fn fold_total(calculator: &dyn Calculator, results: &[LineResult]) -> SectionTotal {
    let mut accumulated: Option<CalcValue> = None;
    for result in results {
        let value = match &result.value {
            Some(value) if !value.is_assignment() && !value.is_error() => value,
            _ => continue,
        };
        accumulated = Some(match accumulated {
            None => value.clone(),
            Some(current) => match calculator.add(&current, value) {
                Ok(sum) => sum,
                Err(error) => CalcValue::Error(error.to_string()),
            },
        });
    }
    match accumulated {
        Some(value) => {
            let formatted = calculator.format(&value);
            SectionTotal::new(value, formatted)
        }
        None => SectionTotal::empty(),
    }
}

/// First assignment per identifier wins; later duplicates lose their value
/// but keep the original parse for cache matching.
fn shadow_duplicate_assignments(results: Vec<LineResult>) -> Vec<LineResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .map(|mut result| {
            if let Some(CalcValue::Assignment { identifier, .. }) = &result.value {
                if !seen.insert(identifier.clone()) {
                    result.shadowed_assignment = result.value.take();
                }
            }
            result
        })
        .collect()
}

/// Identifiers of effective (non-shadowed) assignments in a result list.
fn assignment_identifiers(results: &[LineResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|result| {
            let (identifier, _) = result.value.as_ref()?.as_assignment()?;
            Some(identifier.to_string())
        })
        .collect()
}

/// Assignments whose bound value differs from the constants the pass ran
/// with, including identifiers not bound at all.
fn new_or_changed_assignments(
    constants: &ConstantsMap,
    results: &[LineResult],
) -> Vec<(String, CalcValue)> {
    results
        .iter()
        .filter_map(|result| {
            let (identifier, value) = result.value.as_ref()?.as_assignment()?;
            match constants.get(identifier) {
                Some(bound) if bound == value => None,
                _ => Some((identifier.to_string(), value.clone())),
            }
        })
        .collect()
}

fn next_constants(
    constants: &ConstantsMap,
    new_or_changed: Vec<(String, CalcValue)>,
    removed: &[String],
) -> ConstantsMap {
    let mut next = constants.clone();
    for identifier in removed {
        next.remove(identifier);
    }
    for (identifier, value) in new_or_changed {
        next.insert(identifier, value);
    }
    next
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::calc::{
        CalcError, CalcResult, SimpleCalculator, UnitTable,
    };

    /// Wraps the reference calculator and counts parse calls.
    struct CountingCalculator {
        inner: SimpleCalculator,
        parses: Arc<AtomicUsize>,
    }

    impl Calculator for CountingCalculator {
        fn parse(&self, input: &str, constants: &ConstantsMap) -> CalcResult<CalcValue> {
            self.parses.fetch_add(1, Ordering::SeqCst);
            self.inner.parse(input, constants)
        }

        fn add(&self, left: &CalcValue, right: &CalcValue) -> CalcResult<CalcValue> {
            self.inner.add(left, right)
        }

        fn format(&self, value: &CalcValue) -> String {
            self.inner.format(value)
        }
    }

    fn counting_calculator() -> (Arc<dyn Calculator>, Arc<AtomicUsize>) {
        let parses = Arc::new(AtomicUsize::new(0));
        let calculator = Arc::new(CountingCalculator {
            inner: SimpleCalculator::new(UnitTable::new()),
            parses: parses.clone(),
        });
        (calculator, parses)
    }

    fn state_for(calculator: Arc<dyn Calculator>, inputs: &[&str]) -> EvalState {
        EvalState::new(
            SectionId::from("s1"),
            calculator,
            ConstantsMap::new(),
            inputs.iter().map(|input| input.to_string()).collect(),
            Vec::new(),
        )
    }

    /// Drives a state to completion, returning the outcome and how many
    /// step invocations it took.
    fn drive(evaluator: &SectionEvaluator, mut state: EvalState) -> (SectionOutcome, u32) {
        let mut invocations = 0;
        loop {
            invocations += 1;
            assert!(invocations < 10_000, "evaluation did not finish");
            match evaluator.step(state) {
                StepOutcome::Continue(next) => state = next,
                StepOutcome::Done(outcome) => return (outcome, invocations),
            }
        }
    }

    #[test]
    fn test_single_pass_without_assignments() {
        let (calculator, parses) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, invocations) = drive(&evaluator, state_for(calculator, &["2 + 2", "3 * 3"]));

        assert!(outcome.converged);
        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.results[0].value, Some(CalcValue::number(4.0)));
        assert_eq!(outcome.results[1].value, Some(CalcValue::number(9.0)));
        assert_eq!(outcome.total.formatted, "13");
        // 行ごとに1回ずつパース、最後の呼び出しで完了
        assert_eq!(parses.load(Ordering::SeqCst), 2);
        assert_eq!(invocations, 2);
    }

    #[test]
    fn test_concrete_scenario() {
        let (calculator, _) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, _) = drive(
            &evaluator,
            state_for(calculator, &["2 + 2", "total = 5", "total + 1"]),
        );

        assert!(outcome.converged);
        assert_eq!(outcome.passes, 2);
        assert_eq!(outcome.results[0].value, Some(CalcValue::number(4.0)));
        assert_eq!(
            outcome.results[1].value,
            Some(CalcValue::assignment("total", CalcValue::number(5.0)))
        );
        assert_eq!(outcome.results[2].value, Some(CalcValue::number(6.0)));
        assert_eq!(outcome.total.value, Some(CalcValue::number(10.0)));
        assert_eq!(outcome.total.formatted, "10");
        assert_eq!(
            outcome.constants.get("total"),
            Some(&CalcValue::number(5.0))
        );
    }

    #[test]
    fn test_full_cache_hit_skips_all_parses() {
        let (calculator, parses) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (first, _) = drive(&evaluator, state_for(calculator.clone(), &["1 + 1", "2 + 2"]));
        assert_eq!(parses.load(Ordering::SeqCst), 2);

        let mut state = state_for(calculator, &["1 + 1", "2 + 2"]);
        state.constants = first.constants.clone();
        state.previous_results = first.results.clone();
        let (second, invocations) = drive(&evaluator, state);

        // 全行キャッシュヒット、パース回数は増えない
        assert_eq!(parses.load(Ordering::SeqCst), 2);
        assert_eq!(invocations, 1);
        assert_eq!(second.results, first.results);
        assert_eq!(second.total, first.total);
    }

    #[test]
    fn test_single_edited_line_parses_once() {
        let (calculator, parses) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (first, _) = drive(&evaluator, state_for(calculator.clone(), &["1 + 1", "2 + 2"]));

        let mut state = state_for(calculator, &["1 + 1", "2 + 3"]);
        state.constants = first.constants.clone();
        state.previous_results = first.results.clone();
        let (second, _) = drive(&evaluator, state);

        assert_eq!(parses.load(Ordering::SeqCst), 3);
        assert_eq!(second.results[0].value, Some(CalcValue::number(2.0)));
        assert_eq!(second.results[1].value, Some(CalcValue::number(5.0)));
        assert_eq!(second.total.formatted, "7");
    }

    #[test]
    fn test_duplicate_assignment_policy() {
        let (calculator, _) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, _) = drive(
            &evaluator,
            state_for(calculator, &["x = 1", "x = 2", "x + 1"]),
        );

        assert!(outcome.converged);
        // 最初の代入が勝ち、2つ目はシャドウされる
        assert_eq!(
            outcome.results[0].value,
            Some(CalcValue::assignment("x", CalcValue::number(1.0)))
        );
        assert_eq!(outcome.results[1].value, None);
        assert_eq!(
            outcome.results[1].shadowed_assignment,
            Some(CalcValue::assignment("x", CalcValue::number(2.0)))
        );
        assert_eq!(outcome.results[2].value, Some(CalcValue::number(2.0)));
        assert_eq!(outcome.total.formatted, "2");
        assert_eq!(outcome.constants.get("x"), Some(&CalcValue::number(1.0)));
    }

    #[test]
    fn test_shadowed_line_stays_cache_matchable() {
        let (calculator, parses) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let inputs = ["x = 1", "x = 2", "x + 1"];
        let (first, _) = drive(&evaluator, state_for(calculator.clone(), &inputs));
        let parses_after_first = parses.load(Ordering::SeqCst);

        let mut state = state_for(calculator, &inputs);
        state.constants = first.constants.clone();
        state.previous_results = first.results.clone();
        let (second, _) = drive(&evaluator, state);

        // シャドウされた行も元のパース結果でキャッシュヒットする
        assert_eq!(parses.load(Ordering::SeqCst), parses_after_first);
        assert_eq!(second.results, first.results);
    }

    #[test]
    fn test_removed_assignment_triggers_recalculation() {
        let (calculator, parses) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (first, _) = drive(&evaluator, state_for(calculator.clone(), &["x = 1", "x + 1"]));
        assert_eq!(first.results[1].value, Some(CalcValue::number(2.0)));

        // 代入行を削除すると、残った行は未定義識別子のエラーになる
        let mut state = state_for(calculator, &["x + 1"]);
        state.constants = first.constants.clone();
        state.previous_results = first.results.clone();
        let (second, _) = drive(&evaluator, state);

        assert!(second.converged);
        assert!(matches!(
            second.results[0].value,
            Some(CalcValue::Error(_))
        ));
        assert!(second.total.is_empty());
        assert!(second.constants.is_empty());
        assert!(parses.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn test_chained_assignments_converge() {
        let (calculator, _) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, _) = drive(
            &evaluator,
            state_for(calculator, &["a = 1", "b = a + 1", "a + b"]),
        );

        assert!(outcome.converged);
        assert!(outcome.passes <= 3);
        assert_eq!(outcome.results[2].value, Some(CalcValue::number(3.0)));
        assert_eq!(outcome.total.formatted, "3");
    }

    #[test]
    fn test_parse_error_still_stabilizes() {
        let (calculator, _) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, _) = drive(
            &evaluator,
            state_for(calculator, &["2 +", "3 + 3"]),
        );

        assert!(outcome.converged);
        assert_eq!(outcome.passes, 1);
        assert!(matches!(outcome.results[0].value, Some(CalcValue::Error(_))));
        // エラー行は合計から除外される
        assert_eq!(outcome.total.formatted, "6");
    }

    #[test]
    fn test_empty_section_yields_empty_total() {
        let (calculator, _) = counting_calculator();
        let evaluator = SectionEvaluator::new(32);
        let (outcome, invocations) = drive(&evaluator, state_for(calculator, &[]));

        assert!(outcome.converged);
        assert!(outcome.results.is_empty());
        assert!(outcome.total.is_empty());
        assert_eq!(invocations, 1);
    }

    /// Binds a fresh value on every parse, so the fixed point never
    /// stabilizes.
    struct FlappingCalculator {
        counter: AtomicUsize,
    }

    impl Calculator for FlappingCalculator {
        fn parse(&self, _input: &str, _constants: &ConstantsMap) -> CalcResult<CalcValue> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(CalcValue::assignment("x", CalcValue::number(n as f64)))
        }

        fn add(&self, _left: &CalcValue, _right: &CalcValue) -> CalcResult<CalcValue> {
            Err(CalcError::Unsupported {
                message: "flapping".to_string(),
            })
        }

        fn format(&self, value: &CalcValue) -> String {
            value.to_string()
        }
    }

    #[test]
    fn test_non_convergence_is_capped() {
        let calculator = Arc::new(FlappingCalculator {
            counter: AtomicUsize::new(0),
        });
        let evaluator = SectionEvaluator::new(4);
        let (outcome, _) = drive(&evaluator, state_for(calculator, &["x = ?"]));

        assert!(!outcome.converged);
        assert_eq!(outcome.passes, 4);
        assert_eq!(outcome.results.len(), 1);
    }

    proptest! {
        /// Convergence is bounded by the number of distinct identifiers:
        /// a chain of n dependent assignments needs at most n + 1 passes,
        /// in either source order.
        #[test]
        fn prop_chain_convergence_bound(n in 1usize..=6, reversed in any::<bool>()) {
            let mut lines = vec!["x0 = 1".to_string()];
            for i in 1..n {
                lines.push(format!("x{} = x{} + 1", i, i - 1));
            }
            if reversed {
                lines.reverse();
            }
            lines.push(format!("x{} + 1", n - 1));

            let (calculator, _) = counting_calculator();
            let evaluator = SectionEvaluator::new(32);
            let inputs: Vec<&str> = lines.iter().map(|line| line.as_str()).collect();
            let (outcome, _) = drive(&evaluator, state_for(calculator, &inputs));

            prop_assert!(outcome.converged);
            prop_assert!(outcome.passes as usize <= n + 1);
            let expected = (n + 1) as f64;
            prop_assert_eq!(outcome.total.value, Some(CalcValue::number(expected)));
        }
    }
}
