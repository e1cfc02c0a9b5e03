//! # Evaluation Scheduler
//!
//! Owns the evaluation pipeline for a whole document: the pending queue,
//! the per-section result cache and at most one in-flight evaluation
//! fiber. Sections are evaluated one at a time in load order; loading a
//! section that is currently being evaluated discards the in-flight
//! attempt and starts over with the new inputs, so results are never
//! published for stale text.
//!
//! ## Worker task
//!
//! All state lives in a single worker task. The [`Scheduler`] handle sends
//! it commands over an unbounded channel; between commands the worker
//! advances the active fiber one budgeted burst at a time, taking each
//! burst only after a low-priority scheduling opportunity so incoming
//! commands win the race. Completed evaluations are published on the
//! [`EventBus`](crate::event_bus::EventBus).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::{EvaluationCache, SectionEntry};
use crate::calc::{Calculator, CalculatorFactory, ConstantsMap, UnitTable};
use crate::config::SchedulerConfig;
use crate::evaluator::{EvalState, SectionEvaluator, SectionOutcome};
use crate::event_bus::{
    ErrorEvent, ErrorReceiver, ErrorSeverity, EventBus, EventReceiver, SchedulerEvent,
};
use crate::fiber::{BurstOutcome, Clock, Fiber, MonotonicClock, TaskYield, YieldPoint};
use crate::section::{recover_inputs, SectionId};

enum Command {
    Load {
        section_id: SectionId,
        inputs: Vec<String>,
    },
    Unload {
        section_id: SectionId,
    },
    InvalidateAll {
        units: UnitTable,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
    Shutdown,
}

/// Snapshot of the worker's bookkeeping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulerStatus {
    pub pending_sections: usize,
    pub cached_sections: usize,
    pub evaluating: Option<SectionId>,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler worker is not running")]
    WorkerStopped,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Handle to the scheduler worker task.
///
/// Must be created inside a tokio runtime. Dropping the handle closes the
/// command channel and the worker stops, cancelling any in-flight
/// evaluation.
pub struct Scheduler {
    command_tx: mpsc::UnboundedSender<Command>,
    event_bus: Arc<EventBus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, factory: Arc<dyn CalculatorFactory>) -> Self {
        Self::with_parts(
            config,
            factory,
            Arc::new(MonotonicClock),
            Arc::new(TaskYield),
        )
    }

    /// Full constructor with an injectable clock and yield point, used by
    /// tests to make budget and cancellation behavior deterministic.
    pub fn with_parts(
        config: SchedulerConfig,
        factory: Arc<dyn CalculatorFactory>,
        clock: Arc<dyn Clock>,
        yield_point: Arc<dyn YieldPoint>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config, factory, event_bus.clone(), clock, yield_point);
        let handle = tokio::spawn(worker.run(command_rx));
        Self {
            command_tx,
            event_bus,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Queues a section for evaluation, replacing any pending inputs for
    /// the same section without losing its queue position.
    pub fn load(&self, section_id: SectionId, inputs: Vec<String>) -> SchedulerResult<()> {
        self.send(Command::Load { section_id, inputs })
    }

    /// Drops a section's pending inputs and cached results. Unknown
    /// sections are ignored.
    pub fn unload(&self, section_id: SectionId) -> SchedulerResult<()> {
        self.send(Command::Unload { section_id })
    }

    /// Replaces the unit table and re-queues every cached section for
    /// evaluation under the new units.
    pub fn invalidate_all(&self, units: UnitTable) -> SchedulerResult<()> {
        self.send(Command::InvalidateAll { units })
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        reply_rx.await.map_err(|_| SchedulerError::WorkerStopped)
    }

    /// Stops the worker and waits for it to finish. Idempotent.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        // 既に停止していればsendは失敗するが、その場合も合流は行う
        let _ = self.send(Command::Shutdown);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.await.map_err(|_| SchedulerError::WorkerStopped)?;
        }
        Ok(())
    }

    fn send(&self, command: Command) -> SchedulerResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| SchedulerError::WorkerStopped)
    }
}

/// The one in-flight evaluation. Dropping it is cancellation; nothing of
/// the attempt survives outside this struct until completion.
struct ActiveEvaluation {
    section_id: SectionId,
    calculator: Arc<dyn Calculator>,
    fiber: Fiber<EvalState, SectionOutcome>,
}

struct Worker {
    pending: PendingQueue,
    cache: EvaluationCache,
    units: UnitTable,
    evaluator: SectionEvaluator,
    frame_budget: Duration,
    factory: Arc<dyn CalculatorFactory>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    yield_point: Arc<dyn YieldPoint>,
    active: Option<ActiveEvaluation>,
}

impl Worker {
    fn new(
        config: SchedulerConfig,
        factory: Arc<dyn CalculatorFactory>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        yield_point: Arc<dyn YieldPoint>,
    ) -> Self {
        Self {
            pending: PendingQueue::new(),
            cache: EvaluationCache::new(),
            units: config.units,
            evaluator: SectionEvaluator::new(config.max_recalculation_passes),
            frame_budget: config.frame_budget,
            factory,
            event_bus,
            clock,
            yield_point,
            active: None,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Scheduler worker started");
        let yield_point = self.yield_point.clone();
        loop {
            if self.active.is_some() {
                tokio::select! {
                    biased;
                    // コマンドを優先、評価はその合間に進める
                    command = command_rx.recv() => {
                        match command {
                            Some(command) => {
                                if !self.handle_command(command).await {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = yield_point.wait() => {
                        self.step_active().await;
                    }
                }
            } else {
                match command_rx.recv().await {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        debug!("Scheduler worker stopped");
    }

    /// Returns false when the worker should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Load { section_id, inputs } => {
                self.load(section_id, inputs).await;
                true
            }
            Command::Unload { section_id } => {
                self.unload(section_id).await;
                true
            }
            Command::InvalidateAll { units } => {
                self.invalidate_all(units).await;
                true
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
                true
            }
            Command::Shutdown => {
                debug!("Scheduler worker received shutdown");
                false
            }
        }
    }

    async fn load(&mut self, section_id: SectionId, inputs: Vec<String>) {
        debug!(section_id = %section_id, lines = inputs.len(), "Loading section");
        self.pending.upsert(section_id.clone(), inputs);

        // 評価中のセクションが再ロードされたら、新しい入力でやり直す
        let reloaded_active = self
            .active
            .as_ref()
            .map(|active| active.section_id == section_id)
            .unwrap_or(false);
        if reloaded_active {
            trace!(section_id = %section_id, "Discarding in-flight evaluation of reloaded section");
            self.active = None;
        }

        self.publish(SchedulerEvent::SectionLoaded { section_id })
            .await;
        self.dispatch_next();
    }

    async fn unload(&mut self, section_id: SectionId) {
        let was_pending = self.pending.remove(&section_id);
        let was_cached = self.cache.remove(&section_id).is_some();
        let was_active = self
            .active
            .as_ref()
            .map(|active| active.section_id == section_id)
            .unwrap_or(false);
        if was_active {
            self.active = None;
        }
        if !was_pending && !was_cached && !was_active {
            return;
        }

        debug!(section_id = %section_id, "Unloaded section");
        self.publish(SchedulerEvent::SectionUnloaded { section_id })
            .await;
        self.dispatch_next();
    }

    async fn invalidate_all(&mut self, units: UnitTable) {
        debug!(cached = self.cache.len(), "Invalidating all cached sections");
        self.units = units;
        // 評価中の結果は古い単位に基づくので無条件で破棄する
        self.active = None;

        let mut requeued = 0;
        for (section_id, entry) in self.cache.drain_sorted() {
            if self.pending.contains(&section_id) {
                // 新しい入力が既にキューにあるのでそちらを優先
                continue;
            }
            let inputs = recover_inputs(&entry.results);
            self.pending.upsert(section_id, inputs);
            requeued += 1;
        }

        self.publish(SchedulerEvent::CacheInvalidated { requeued })
            .await;
        self.dispatch_next();
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            pending_sections: self.pending.len(),
            cached_sections: self.cache.len(),
            evaluating: self.active.as_ref().map(|active| active.section_id.clone()),
        }
    }

    /// Starts evaluating the front of the queue if nothing is in flight.
    /// The pending entry stays queued until its evaluation completes, so a
    /// cancelled attempt is re-dispatched from here.
    fn dispatch_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let (section_id, inputs) = match self.pending.front() {
            Some((section_id, inputs)) => (section_id.clone(), inputs.to_vec()),
            None => return,
        };

        // キャッシュは完了時にのみ書き換わるので読むだけ
        let (previous_results, constants, calculator) = match self.cache.get(&section_id) {
            Some(entry) => (
                entry.results.clone(),
                entry.constants.clone(),
                entry.calculator.clone(),
            ),
            None => (
                Vec::new(),
                ConstantsMap::new(),
                self.factory.instance(&self.units),
            ),
        };

        trace!(section_id = %section_id, lines = inputs.len(), "Dispatching evaluation");
        let state = EvalState::new(
            section_id.clone(),
            calculator.clone(),
            constants,
            inputs,
            previous_results,
        );
        let evaluator = self.evaluator.clone();
        let fiber = Fiber::new(
            Box::new(move |state| evaluator.step(state)),
            state,
            self.frame_budget,
            self.clock.clone(),
        );
        self.active = Some(ActiveEvaluation {
            section_id,
            calculator,
            fiber,
        });
    }

    async fn step_active(&mut self) {
        let finished = match self.active.as_mut() {
            Some(active) => match active.fiber.run_burst() {
                BurstOutcome::Yielded => {
                    if let Some(state) = active.fiber.state() {
                        trace!(
                            section_id = %state.section_id,
                            pass = state.pass,
                            remaining = state.remaining(),
                            recalculating = state.force_recalculation,
                            "Evaluation yielded within budget"
                        );
                    }
                    None
                }
                BurstOutcome::Finished(outcome) => Some(outcome),
            },
            None => None,
        };
        if let Some(outcome) = finished {
            let calculator = match self.active.take() {
                Some(active) => active.calculator,
                None => return,
            };
            self.complete(calculator, outcome).await;
        }
    }

    async fn complete(&mut self, calculator: Arc<dyn Calculator>, outcome: SectionOutcome) {
        let SectionOutcome {
            section_id,
            results,
            constants,
            total,
            converged,
            passes,
        } = outcome;
        debug!(section_id = %section_id, passes, converged, "Section evaluation completed");

        self.cache.insert(
            section_id.clone(),
            SectionEntry {
                results: results.clone(),
                constants,
                calculator,
            },
        );
        self.pending.remove(&section_id);

        if !converged {
            warn!(section_id = %section_id, passes, "Section did not stabilize within pass limit");
            self.publish_error(ErrorEvent {
                error_type: "did_not_converge".to_string(),
                message: format!(
                    "section {} did not stabilize after {} passes",
                    section_id, passes
                ),
                severity: ErrorSeverity::Warning,
                section_id: Some(section_id.clone()),
            })
            .await;
        }

        self.publish(SchedulerEvent::SectionEvaluated {
            section_id,
            results,
            total,
        })
        .await;
        self.dispatch_next();
    }

    // FnMutのステップ関数を抱えるWorkerはSyncではないので、awaitをまたぐ
    // 借用は&mutに揃えてrunのfutureをSendに保つ
    async fn publish(&mut self, event: SchedulerEvent) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }

    async fn publish_error(&mut self, error: ErrorEvent) {
        if let Err(e) = self.event_bus.publish_error(error).await {
            warn!("Failed to publish error event: {}", e);
        }
    }
}

/// FIFO of sections awaiting evaluation. Reloading a pending section
/// replaces its inputs in place so it keeps its position.
struct PendingQueue {
    order: VecDeque<SectionId>,
    inputs: HashMap<SectionId, Vec<String>>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            inputs: HashMap::new(),
        }
    }

    fn upsert(&mut self, section_id: SectionId, inputs: Vec<String>) {
        if self.inputs.insert(section_id.clone(), inputs).is_none() {
            self.order.push_back(section_id);
        }
    }

    fn remove(&mut self, section_id: &SectionId) -> bool {
        if self.inputs.remove(section_id).is_some() {
            self.order.retain(|queued| queued != section_id);
            true
        } else {
            false
        }
    }

    fn contains(&self, section_id: &SectionId) -> bool {
        self.inputs.contains_key(section_id)
    }

    fn front(&self) -> Option<(&SectionId, &[String])> {
        let section_id = self.order.front()?;
        let inputs = self.inputs.get(section_id)?;
        Some((section_id, inputs.as_slice()))
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}
