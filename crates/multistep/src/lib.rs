// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small engine for running ordered, partially reversible pipelines of
//! steps against a shared state.
//!
//! A pipeline is a list of [`Step`]s. The [`Runner`] invokes each step's
//! `run` in order. A step that returns [`StepOutcome::Halt`] stops forward
//! progress, after which the runner unwinds by invoking `cleanup` on every
//! step that ran, newest first. Builds can also be cancelled from outside;
//! cancellation is observed cooperatively through [`Cancellation`].
//!
//! The [`watch`] module provides the wait-until-ready primitive that steps use
//! to block on external resources that change state asynchronously.

pub mod cancel;
pub mod runner;
pub mod state;
pub mod step;
pub mod ui;
pub mod watch;

pub use cancel::{sleep_or_cancel, Cancellation, CancellationSource, Cancelled};
pub use runner::{
    OnError, PauseHook, RunReport, RunState, Runner, StepRecord, StepStatus,
};
pub use state::{StateBag, StateError, StateValue, StepState};
pub use step::{CleanupPolicy, Step, StepContext, StepOutcome};
pub use ui::{RecordingUi, TracingUi, Ui, UiMessage};
pub use watch::{
    poll_stream, Observation, Readiness, ResourceId, Watch, WatchError,
    WatchObserver,
};
