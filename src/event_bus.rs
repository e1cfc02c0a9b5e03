//! # Event Bus
//!
//! Outbound channel of the scheduler. Completed section evaluations and
//! bookkeeping notifications flow to every subscriber as
//! [`SchedulerEvent`]s; non-fatal problems (such as a section that refused
//! to converge) flow separately as [`ErrorEvent`]s so monitoring can watch
//! one channel without consuming results.
//!
//! ## Channels
//!
//! Both channels are tokio broadcast channels with a shared capacity. The
//! bus holds an internal receiver on each so publishing never fails just
//! because no subscriber has arrived yet. Slow subscribers can lag; the
//! receiver then resubscribes and reports how many events were skipped.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::section::{LineResult, SectionId, SectionTotal};

/// One scheduler notification.
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum SchedulerEvent {
    /// Pending inputs were recorded for a section.
    SectionLoaded { section_id: SectionId },
    /// A section's pending inputs and cache entry were dropped.
    SectionUnloaded { section_id: SectionId },
    /// A section reached a stable evaluation. Fired exactly once per
    /// completed evaluation; `results` is positional against the inputs
    /// the evaluation ended with.
    SectionEvaluated {
        section_id: SectionId,
        results: Vec<LineResult>,
        total: SectionTotal,
    },
    /// The unit table changed; `requeued` cached sections were re-queued.
    CacheInvalidated { requeued: usize },
}

impl SchedulerEvent {
    pub fn section_id(&self) -> Option<&SectionId> {
        match self {
            Self::SectionLoaded { section_id }
            | Self::SectionUnloaded { section_id }
            | Self::SectionEvaluated { section_id, .. } => Some(section_id),
            Self::CacheInvalidated { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub section_id: Option<SectionId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorSeverity {
    #[default]
    Warning, // 通知のみ
    Error,    // 処理中断
    Critical, // システム停止
}

/// Broadcast bus carrying scheduler and error events.
pub struct EventBus {
    event_sender: broadcast::Sender<SchedulerEvent>,
    error_sender: broadcast::Sender<ErrorEvent>,
    capacity: usize,
    /// Internal receiver to keep the event channel open
    _internal_receiver: broadcast::Receiver<SchedulerEvent>,
    /// Internal receiver to keep the error channel open
    _internal_error_receiver: broadcast::Receiver<ErrorEvent>,
}

impl EventBus {
    /// Creates a bus whose channels buffer up to `capacity` unprocessed
    /// events each.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use keisan::event_bus::EventBus;
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (event_sender, event_receiver) = broadcast::channel(capacity);
        let (error_sender, error_receiver) = broadcast::channel(capacity);
        Self {
            event_sender,
            error_sender,
            capacity,
            _internal_receiver: event_receiver,
            _internal_error_receiver: error_receiver,
        }
    }

    /// Subscribes to both regular and error events.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use keisan::event_bus::EventBus;
    /// # async fn example() {
    /// let event_bus = EventBus::new(100);
    /// let (mut event_rx, _error_rx) = event_bus.subscribe();
    /// while let Ok(event) = event_rx.recv().await {
    ///     println!("{}", event);
    /// }
    /// # }
    /// ```
    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        let event_rx = self.event_sender.subscribe();
        let error_rx = self.error_sender.subscribe();
        (EventReceiver::new(event_rx), ErrorReceiver::new(error_rx))
    }

    pub async fn publish(&self, event: SchedulerEvent) -> EventResult<()> {
        debug_event("Publishing", &event);
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Publishes without awaiting, for synchronous call sites.
    pub fn sync_publish(&self, event: SchedulerEvent) -> EventResult<()> {
        debug_event("Sync Publishing", &event);
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn publish_error(&self, error: ErrorEvent) -> EventResult<()> {
        self.error_sender
            .send(error)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn sync_publish_error(&self, error: ErrorEvent) -> EventResult<()> {
        self.error_sender
            .send(error)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn queue_size(&self) -> usize {
        self.event_sender.len()
    }

    pub fn error_queue_size(&self) -> usize {
        self.error_sender.len()
    }

    pub fn subscribers_size(&self) -> usize {
        self.event_sender.receiver_count()
    }

    pub fn error_subscribers_size(&self) -> usize {
        self.error_sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Evaluations fire on every keystroke burst; keep the chatty kinds at
/// trace level.
pub fn debug_event(prefix: &str, event: &SchedulerEvent) {
    match event {
        SchedulerEvent::SectionLoaded { .. } | SchedulerEvent::SectionUnloaded { .. } => {
            trace!("{} Event: {:?}", prefix, event)
        }
        _ => debug!("{} Event: {:?}", prefix, event),
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<SchedulerEvent>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<SchedulerEvent>) -> Self {
        Self { receiver }
    }

    /// イベントを受信する。Laggedエラーが発生した場合はresubscribeを試みて、エラーを返す。
    /// 利用側で、Laggedなどが発生しないようできるだけすぐに次のrecvを呼ぶようにする。
    pub async fn recv(&mut self) -> EventResult<SchedulerEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // n個のメッセージをスキップ
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}

pub struct ErrorReceiver {
    receiver: broadcast::Receiver<ErrorEvent>,
}

impl ErrorReceiver {
    fn new(receiver: broadcast::Receiver<ErrorEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> EventResult<ErrorEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| EventError::ReceiveFailed {
                message: e.to_string(),
            })
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to send event: {message}")]
    SendFailed { message: String },

    #[error("Failed to receive event: {message}")]
    ReceiveFailed { message: String },

    #[error("Receiver lagged, skipped {count} events")]
    Lagged { count: u64 },
}

pub type EventResult<T> = Result<T, EventError>;
