use thiserror::Error;

use crate::calc::CalcError;
use crate::event_bus::EventError;
use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Calc error: {0}")]
    Calc(#[from] CalcError),
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
