//! # Cooperative Task Runner
//!
//! Runs a step function in budgeted synchronous bursts. The step function
//! returns [`StepOutcome::Continue`] with updated state to request another
//! invocation or [`StepOutcome::Done`] when finished. Within one call to
//! [`Fiber::run_burst`], an invocation that completes under the budget is
//! followed synchronously by the next one; an invocation that exceeds the
//! budget ends the burst, and the owner resumes after the next low-priority
//! scheduling opportunity ([`YieldPoint`]).
//!
//! Cancellation is structural: drop the fiber and no continuation exists to
//! run. The suspended state is a plain value, inspectable via
//! [`Fiber::state`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// What a step function requests next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<S, R> {
    /// Invoke again with this state.
    Continue(S),
    /// The task finished with this result.
    Done(R),
}

/// What one burst produced.
#[derive(Debug, Clone, PartialEq)]
pub enum BurstOutcome<R> {
    /// Budget exhausted; state is retained for the next burst.
    Yielded,
    /// The step function finished.
    Finished(R),
}

/// Monotonic time source. Injectable so budget behavior is testable with a
/// fake elapsed-time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The low-priority scheduling opportunity awaited between bursts.
#[async_trait]
pub trait YieldPoint: Send + Sync {
    async fn wait(&self);
}

/// Default yield point: hand control back to the tokio scheduler once.
#[derive(Debug, Clone, Default)]
pub struct TaskYield;

#[async_trait]
impl YieldPoint for TaskYield {
    async fn wait(&self) {
        tokio::task::yield_now().await;
    }
}

// ステップ関数の型
pub type StepFn<S, R> = Box<dyn FnMut(S) -> StepOutcome<S, R> + Send>;

/// One cooperative, resumable task.
pub struct Fiber<S, R> {
    step: StepFn<S, R>,
    state: Option<S>,
    budget: Duration,
    clock: Arc<dyn Clock>,
}

impl<S, R> Fiber<S, R> {
    pub fn new(step: StepFn<S, R>, initial: S, budget: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            step,
            state: Some(initial),
            budget,
            clock,
        }
    }

    /// The most recent suspended state, `None` once the fiber finished.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Runs step invocations until the step finishes or one invocation's
    /// elapsed time reaches the budget. A finished fiber yields forever.
    pub fn run_burst(&mut self) -> BurstOutcome<R> {
        loop {
            let state = match self.state.take() {
                Some(state) => state,
                None => return BurstOutcome::Yielded,
            };
            let started = self.clock.now();
            match (self.step)(state) {
                StepOutcome::Done(result) => return BurstOutcome::Finished(result),
                StepOutcome::Continue(next) => {
                    let elapsed = self.clock.now().saturating_duration_since(started);
                    self.state = Some(next);
                    if elapsed >= self.budget {
                        return BurstOutcome::Yielded;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Advances a fixed amount on every `now` call, so each step invocation
    /// appears to take `advance_per_call`.
    struct SteppingClock {
        base: Instant,
        offset: Mutex<Duration>,
        advance_per_call: Duration,
    }

    impl SteppingClock {
        fn new(advance_per_call: Duration) -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                advance_per_call,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Instant {
            let mut offset = self.offset.lock().unwrap();
            let now = self.base + *offset;
            *offset += self.advance_per_call;
            now
        }
    }

    fn counting_step(limit: u32) -> StepFn<u32, u32> {
        Box::new(move |state| {
            if state < limit {
                StepOutcome::Continue(state + 1)
            } else {
                StepOutcome::Done(state)
            }
        })
    }

    #[test]
    fn test_fast_steps_finish_in_one_burst() {
        let mut fiber = Fiber::new(
            counting_step(100),
            0,
            Duration::from_millis(8),
            Arc::new(MonotonicClock),
        );
        assert_eq!(fiber.run_burst(), BurstOutcome::Finished(100));
        assert!(fiber.state().is_none());
    }

    #[test]
    fn test_slow_step_yields_each_burst() {
        // 1回のステップ実行が10msかかる想定、バジェットは8ms
        let clock = Arc::new(SteppingClock::new(Duration::from_millis(10)));
        let mut fiber = Fiber::new(counting_step(3), 0, Duration::from_millis(8), clock);

        assert_eq!(fiber.run_burst(), BurstOutcome::Yielded);
        assert_eq!(fiber.state(), Some(&1));
        assert_eq!(fiber.run_burst(), BurstOutcome::Yielded);
        assert_eq!(fiber.run_burst(), BurstOutcome::Yielded);
        assert_eq!(fiber.state(), Some(&3));
        assert_eq!(fiber.run_burst(), BurstOutcome::Finished(3));
    }

    #[test]
    fn test_finished_fiber_keeps_yielding() {
        let mut fiber = Fiber::new(
            counting_step(1),
            0,
            Duration::from_millis(8),
            Arc::new(MonotonicClock),
        );
        assert_eq!(fiber.run_burst(), BurstOutcome::Finished(1));
        assert_eq!(fiber.run_burst(), BurstOutcome::Yielded);
        assert!(fiber.state().is_none());
    }

    #[test]
    fn test_dropped_fiber_stops_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let step: StepFn<u32, u32> = Box::new(move |state| {
            counter.fetch_add(1, Ordering::SeqCst);
            StepOutcome::Continue(state + 1)
        });
        let clock = Arc::new(SteppingClock::new(Duration::from_millis(10)));
        let mut fiber = Fiber::new(step, 0, Duration::from_millis(8), clock);

        assert_eq!(fiber.run_burst(), BurstOutcome::Yielded);
        drop(fiber);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_yield_completes() {
        TaskYield.wait().await;
    }
}
