//! Staged progress reporting with cooperative cancellation.
//!
//! Long operations are split into named stages, each with its own step
//! counter. The controller publishes an immutable [`ProgressStatus`] after
//! every stage transition and every `report_interval` steps, and it is the
//! only place cancellation is observed: each call returns `false` once the
//! shared [`CancelToken`] has been tripped, and the caller unwinds by
//! returning [`Outcome::Cancelled`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::ledger::error::{LedgerError, Result};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of an operation's progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressStatus {
    pub stage: String,
    pub stages_done: usize,
    pub num_stages: usize,
    pub steps_done: usize,
    pub num_steps: usize,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} ({}/{})",
            self.stages_done, self.num_stages, self.stage, self.steps_done, self.num_steps
        )
    }
}

/// Result of an operation that may have been cancelled part-way.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T = ()> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Converts cancellation into the error reported to the user. Only the
    /// outermost caller of an operation should do this.
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Cancelled => Err(LedgerError::cancelled()),
        }
    }
}

type Publisher = Box<dyn FnMut(ProgressStatus) + Send>;

pub const DEFAULT_REPORT_INTERVAL: usize = 25;

pub struct ProgressController {
    cancel: CancelToken,
    publisher: Option<Publisher>,
    report_interval: usize,
    stage: Option<String>,
    num_stages: usize,
    stages_done: usize,
    num_steps: usize,
    steps_done: usize,
    last_reported: usize,
}

impl fmt::Debug for ProgressController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressController")
            .field("status", &self.status())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProgressController {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            publisher: None,
            report_interval: DEFAULT_REPORT_INTERVAL,
            stage: None,
            num_stages: 0,
            stages_done: 0,
            num_steps: 0,
            steps_done: 0,
            last_reported: 0,
        }
    }

    /// A controller that never reports and is never cancelled.
    pub fn detached() -> Self {
        Self::new(CancelToken::new())
    }

    pub fn with_publisher(mut self, publisher: impl FnMut(ProgressStatus) + Send + 'static) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    pub fn with_report_interval(mut self, interval: usize) -> Self {
        self.report_interval = interval.max(1);
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> ProgressStatus {
        ProgressStatus {
            stage: self.stage.clone().unwrap_or_default(),
            stages_done: self.stages_done,
            num_stages: self.num_stages,
            steps_done: self.steps_done,
            num_steps: self.num_steps,
        }
    }

    fn publish(&mut self) {
        let status = self.status();
        debug!(%status, "progress");
        if let Some(publisher) = self.publisher.as_mut() {
            publisher(status);
        }
    }

    /// Starts a multi-stage operation.
    pub fn set_num_stages(&mut self, stages: usize) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.num_stages = stages;
        self.stages_done = 0;
        self.stage = None;
        self.num_steps = 0;
        self.steps_done = 0;
        self.last_reported = 0;
        true
    }

    /// Closes the current stage and opens the next one.
    pub fn set_new_stage(&mut self, name: impl Into<String>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if self.stage.is_some() {
            self.stages_done += 1;
        }
        self.stage = Some(name.into());
        self.num_steps = 0;
        self.steps_done = 0;
        self.last_reported = 0;
        self.publish();
        true
    }

    pub fn set_num_steps(&mut self, steps: usize) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.num_steps = steps;
        self.steps_done = 0;
        self.last_reported = 0;
        self.publish();
        true
    }

    /// Records step progress. Publication and the cancellation check happen
    /// every `report_interval` steps and on the final step.
    pub fn set_steps_done(&mut self, steps: usize) -> bool {
        self.steps_done = steps;
        let due = steps.saturating_sub(self.last_reported) >= self.report_interval
            || (self.num_steps > 0 && steps >= self.num_steps);
        if !due {
            return true;
        }
        if self.is_cancelled() {
            return false;
        }
        self.last_reported = steps;
        self.publish();
        true
    }

    /// Marks the final stage as closed.
    pub fn complete(&mut self) {
        if self.stage.is_some() {
            self.stages_done = self.num_stages.max(self.stages_done + 1);
        }
        self.publish();
    }
}
