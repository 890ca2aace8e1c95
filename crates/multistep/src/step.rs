// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unit of work a pipeline is built from.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::Cancellation;
use crate::state::StepState;
use crate::ui::Ui;

/// What a step's `run` tells the runner to do next.
pub enum StepOutcome {
    /// Proceed to the next step.
    Continue,

    /// Stop forward progress and unwind. The error becomes the run's
    /// terminal error.
    Halt(anyhow::Error),
}

impl StepOutcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, StepOutcome::Continue)
    }
}

impl fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Continue => f.write_str("Continue"),
            StepOutcome::Halt(e) => write!(f, "Halt({e:#})"),
        }
    }
}

impl From<anyhow::Result<()>> for StepOutcome {
    fn from(res: anyhow::Result<()>) -> Self {
        match res {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Halt(e),
        }
    }
}

/// When the runner calls a step's `cleanup`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Only while unwinding after a halt or cancellation.
    OnFailure,

    /// After a halt or cancellation and also after the pipeline completes.
    Always,
}

/// Per-run context handed to every step.
#[derive(Clone)]
pub struct StepContext {
    pub build_name: String,
    pub ui: Arc<dyn Ui>,
    pub cancel: Cancellation,
}

impl StepContext {
    pub fn new(
        build_name: impl Into<String>,
        ui: Arc<dyn Ui>,
        cancel: Cancellation,
    ) -> Self {
        Self { build_name: build_name.into(), ui, cancel }
    }

    /// The context cleanups run with. Cleanups must be able to finish their
    /// own waits even when the build was cancelled, so they get a token that
    /// never fires.
    pub(crate) fn for_cleanup(&self) -> Self {
        Self {
            build_name: self.build_name.clone(),
            ui: Arc::clone(&self.ui),
            cancel: Cancellation::never(),
        }
    }
}

/// One stage of a pipeline.
///
/// `run` is called at most once per pipeline run. `cleanup` is called at most
/// once, during unwind or, for [`CleanupPolicy::Always`] steps, after the
/// pipeline completes. `cleanup` must cope with `run` having never been
/// called, having failed part way, or having been cancelled; it should
/// consult the state to find out what `run` actually did.
#[async_trait]
pub trait Step<S: StepState>: Send + Sync {
    fn name(&self) -> &str;

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::OnFailure
    }

    async fn run(&self, ctx: &StepContext, state: &mut S) -> StepOutcome;

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        _state: &mut S,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
