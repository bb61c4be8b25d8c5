//! Outcome of a single reconcile check
//!
//! Every check returns a [`ReconcileResult`]. A pass runs its checks in
//! order and stops at the first completed one:
//!
//! ```ignore
//! let result = ctx.check_racks().await;
//! if result.is_completed() {
//!     return result;
//! }
//! ```

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::{Error, Result};

#[derive(Debug)]
pub enum ReconcileResult {
    /// Nothing to do here, run the next check
    Continue,
    /// Pass is finished, wait for the next watch event
    Done,
    /// Pass is finished, run again after the given number of seconds
    RequeueSoon(u64),
    /// Pass failed, the controller's error policy decides when to retry
    Error(Error),
}

/// What a completed result asks of the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Finished,
    RequeueAfter(Duration),
}

impl ReconcileResult {
    pub fn is_completed(&self) -> bool {
        !matches!(self, ReconcileResult::Continue)
    }

    /// Turn a completed result into what the controller needs.
    ///
    /// # Panics
    ///
    /// Panics on `Continue`: a non-terminal result has nothing to return and
    /// reaching this is a bug in the caller's check chain.
    pub fn output(self) -> Result<Completion> {
        match self {
            ReconcileResult::Continue => panic!("there was no Result to return"),
            ReconcileResult::Done => Ok(Completion::Finished),
            ReconcileResult::RequeueSoon(secs) => {
                Ok(Completion::RequeueAfter(Duration::from_secs(secs)))
            }
            ReconcileResult::Error(e) => Err(e),
        }
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileResult::Continue => "continue",
            ReconcileResult::Done => "done",
            ReconcileResult::RequeueSoon(_) => "requeue",
            ReconcileResult::Error(_) => "error",
        }
    }
}

impl From<Error> for ReconcileResult {
    fn from(e: Error) -> Self {
        ReconcileResult::Error(e)
    }
}

impl From<Completion> for Action {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Finished => Action::await_change(),
            Completion::RequeueAfter(after) => Action::requeue(after),
        }
    }
}

/// Unwrap a `Result` inside a check, turning an error into a completed
/// `ReconcileResult::Error`.
macro_rules! try_check {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::controller::result::ReconcileResult::Error(e.into()),
        }
    };
}
pub(crate) use try_check;
