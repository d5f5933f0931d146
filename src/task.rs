//! Scoped task group and per-slot error collection.
//!
//! Every unit spawned into a [`TaskGroup`] is joined by [`TaskGroup::join`];
//! dropping the group aborts whatever is still running, and the units' own
//! drop guards (kill-on-drop processes, fire-on-drop signals) do the rest.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{filter_test_error, HarnessError};

type UnitOutput = (usize, Result<(), HarnessError>);

/// Group of named units run concurrently and joined together.
pub struct TaskGroup {
    set: JoinSet<UnitOutput>,
    names: Vec<String>,
    cancel_on_error: Option<RunContext>,
}

/// What every unit of a group returned, in spawn order.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub units: Vec<(String, Option<HarnessError>)>,
    first_error: Option<usize>,
}

impl GroupOutcome {
    /// First unexpected (non-cancellation) error, in completion order.
    pub fn first_error(&self) -> Option<(&str, &HarnessError)> {
        let idx = self.first_error?;
        let (name, err) = &self.units[idx];
        err.as_ref().map(|e| (name.as_str(), e))
    }

    pub fn into_errors(self) -> impl Iterator<Item = (String, HarnessError)> {
        self.units
            .into_iter()
            .filter_map(|(name, err)| err.map(|e| (name, e)))
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            names: Vec::new(),
            cancel_on_error: None,
        }
    }

    /// Cancel `scope` as soon as any unit fails with an unexpected error.
    pub fn cancel_on_error(mut self, scope: &RunContext) -> Self {
        self.cancel_on_error = Some(scope.clone());
        self
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), HarnessError>> + Send + 'static,
    {
        let idx = self.names.len();
        let name = name.into();
        debug!(unit = %name, "spawning unit");
        self.names.push(name.clone());
        self.set.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => (idx, result),
                Err(panic) => (
                    idx,
                    Err(HarnessError::Join {
                        name,
                        message: panic_message(panic.as_ref()),
                    }),
                ),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Wait for every unit to finish.
    pub async fn join(&mut self) -> GroupOutcome {
        let mut slots: Vec<Option<Option<HarnessError>>> =
            (0..self.names.len()).map(|_| None).collect();
        let mut first_error = None;

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    let err = result.err();
                    if let Some(e) = &err {
                        if !e.is_cancellation() && first_error.is_none() {
                            warn!(unit = %self.names[idx], error = %e, "unit failed");
                            first_error = Some(idx);
                            if let Some(scope) = &self.cancel_on_error {
                                scope.cancel();
                            }
                        }
                    }
                    slots[idx] = Some(err);
                }
                Err(e) => {
                    // Only an abort lands here; panics are caught inside the unit.
                    warn!(error = %e, "unit aborted");
                }
            }
        }

        let units = self
            .names
            .drain(..)
            .zip(slots)
            .map(|(name, slot)| {
                let err = slot.unwrap_or_else(|| {
                    Some(HarnessError::Join {
                        name: name.clone(),
                        message: "aborted".to_string(),
                    })
                });
                (name, err)
            })
            .collect();

        GroupOutcome { units, first_error }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// One error slot per sub-operation or assertion of a run.
#[derive(Debug, Default)]
pub struct ErrorSlots {
    slots: Vec<(String, HarnessError)>,
}

impl ErrorSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, slot: impl Into<String>, err: HarnessError) {
        self.slots.push((slot.into(), err));
    }

    /// Record `err` if `result` failed; pass the value through otherwise.
    pub fn record_result<T>(&mut self, slot: impl Into<String>, result: Result<T, HarnessError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(slot, e);
                None
            }
        }
    }

    /// Record an assertion failure unless `cond` holds.
    pub fn check(&mut self, slot: impl Into<String>, cond: bool, msg: impl FnOnce() -> String) {
        if !cond {
            self.record(slot, HarnessError::Assertion(msg()));
        }
    }

    /// Take over every unit error of a joined group.
    pub fn extend(&mut self, outcome: GroupOutcome) {
        self.slots.extend(outcome.into_errors());
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Filter against the run context and surface what is left.
    pub fn finish(self, ctx: &RunContext) -> Result<(), HarnessError> {
        for (slot, err) in &self.slots {
            debug!(slot = %slot, error = %err, "slot error");
        }
        match filter_test_error(ctx.err(), self.slots.into_iter().map(|(_, e)| e)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
