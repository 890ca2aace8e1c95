// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a pipeline of steps over one state value.
//!
//! The runner moves through the states in [`RunState`]. Each step's `run` is
//! invoked in order; `Continue` advances to the next step and `Halt` stops
//! forward progress. Cancellation is checked at every step boundary (and by
//! steps themselves at their own safe points). After a halt or cancellation
//! the runner unwinds by calling `cleanup` on every step whose `run` was
//! invoked, newest first, including the step that halted. A cleanup that
//! fails or panics is logged and the unwind carries on with the next one.
//!
//! The runner publishes its state through a `tokio::sync::watch` channel so
//! that callers can follow progress without polling.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cancel::Cancelled;
use crate::state::{StepState, CANCELLED_KEY, HALTED_KEY};
use crate::step::{CleanupPolicy, Step, StepContext, StepOutcome};

/// Invoked with a step's name before that step runs. The runner waits for
/// the returned future (or for cancellation) before continuing.
pub type PauseHook = Arc<dyn Fn(&str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Position of a run in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    NotStarted,

    /// The step at this index is running.
    Running(usize),

    /// Every step returned `Continue`.
    Completed,

    /// The step at this index returned `Halt`; the run has been unwound.
    Halted(usize),

    /// Cancellation was observed while the step at this index was running or
    /// before it started; the run has been unwound.
    Cancelled(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    NotRun,
    Continued,
    Halted,
}

/// What happened to one step during a run.
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration: Option<Duration>,
    pub cleaned_up: bool,
    pub cleanup_error: Option<String>,
}

impl StepRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: StepStatus::NotRun,
            duration: None,
            cleaned_up: false,
            cleanup_error: None,
        }
    }
}

/// The result of a completed call to [`Runner::run`].
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,

    /// The error that halted the run, or the cancellation error. `None` for
    /// completed runs.
    pub error: Option<anyhow::Error>,

    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// The name of the step that halted or was cancelled, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self.state {
            RunState::Halted(i) | RunState::Cancelled(i) => {
                self.steps.get(i).map(|r| r.name.as_str())
            }
            _ => None,
        }
    }
}

/// What the runner does after a step halts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnError {
    /// Unwind by cleaning up every step that ran.
    #[default]
    Cleanup,

    /// Leave everything as it is for inspection. Cancellation still unwinds.
    Abort,
}

pub struct Runner<S: StepState> {
    steps: Vec<Box<dyn Step<S>>>,
    pause: Option<PauseHook>,
    on_error: OnError,
    state_tx: watch::Sender<RunState>,
}

impl<S: StepState> Runner<S> {
    pub fn new(steps: Vec<Box<dyn Step<S>>>) -> Self {
        let (state_tx, _) = watch::channel(RunState::NotStarted);
        Self { steps, pause: None, on_error: OnError::Cleanup, state_tx }
    }

    /// Installs a hook the runner awaits before each step.
    pub fn with_pause_hook(mut self, hook: PauseHook) -> Self {
        self.pause = Some(hook);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Returns a receiver that observes every state transition of this run.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, state: RunState) {
        self.state_tx.send_replace(state);
    }

    /// Runs the pipeline to a terminal state. Consuming the runner guarantees
    /// each step's `run` and `cleanup` are called at most once.
    pub async fn run(self, ctx: &StepContext, state: &mut S) -> RunReport {
        let mut records: Vec<StepRecord> =
            self.steps.iter().map(|s| StepRecord::new(s.name())).collect();
        let mut error = None;
        let mut terminal = RunState::Completed;

        // Number of steps whose `run` has been invoked. These, and only
        // these, are eligible for cleanup.
        let mut invoked = 0;

        info!(
            build = %ctx.build_name,
            steps = self.steps.len(),
            "starting pipeline"
        );

        for (idx, step) in self.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(step = step.name(), "cancelled before step started");
                terminal = RunState::Cancelled(idx);
                break;
            }

            if let Some(pause) = &self.pause {
                let cancelled = tokio::select! {
                    biased;

                    _ = ctx.cancel.cancelled() => true,
                    _ = pause(step.name()) => false,
                };
                if cancelled {
                    terminal = RunState::Cancelled(idx);
                    break;
                }
            }

            self.publish(RunState::Running(idx));
            invoked = idx + 1;

            let span = info_span!("step", step = step.name(), index = idx);
            let start = Instant::now();
            let outcome =
                AssertUnwindSafe(step.run(ctx, state).instrument(span))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        StepOutcome::Halt(anyhow!(
                            "step {} panicked: {}",
                            step.name(),
                            panic_message(panic.as_ref())
                        ))
                    });
            records[idx].duration = Some(start.elapsed());

            match outcome {
                StepOutcome::Continue => {
                    records[idx].status = StepStatus::Continued;
                }
                StepOutcome::Halt(e) => {
                    records[idx].status = StepStatus::Halted;
                    terminal = if ctx.cancel.is_cancelled() {
                        RunState::Cancelled(idx)
                    } else {
                        RunState::Halted(idx)
                    };
                    error!(step = step.name(), error = %format!("{e:#}"), "step halted");
                    error = Some(e);
                    break;
                }
            }
        }

        match terminal {
            RunState::Halted(_) => {
                let bag = state.bag_mut();
                bag.put(HALTED_KEY, true);
                if let Some(e) = &error {
                    bag.record_error(format!("{e:#}"));
                }
            }
            RunState::Cancelled(_) => {
                let err = error.get_or_insert_with(|| {
                    anyhow::Error::new(Cancelled).context("build was cancelled")
                });
                let message = format!("{err:#}");
                let bag = state.bag_mut();
                bag.put(CANCELLED_KEY, true);
                bag.record_error(message);
            }
            _ => {}
        }

        let unwinding = terminal != RunState::Completed;
        let abort = matches!(terminal, RunState::Halted(_))
            && self.on_error == OnError::Abort;
        if abort {
            warn!("leaving resources in place, skipping cleanup");
            ctx.ui.error("Build failed; skipping cleanup as requested");
        }
        let cleanup_ctx = ctx.for_cleanup();
        for idx in (0..invoked).rev() {
            if abort {
                break;
            }
            let step = &self.steps[idx];
            if !unwinding && step.cleanup_policy() != CleanupPolicy::Always {
                continue;
            }

            records[idx].cleaned_up = true;
            let span = info_span!("cleanup", step = step.name(), index = idx);
            let res = AssertUnwindSafe(
                step.cleanup(&cleanup_ctx, state).instrument(span),
            )
            .catch_unwind()
            .await;

            let failure = match res {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(format!(
                    "cleanup panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Some(msg) = failure {
                warn!(step = step.name(), error = %msg, "cleanup failed, continuing unwind");
                ctx.ui.error(&format!("Cleanup of {} failed: {msg}", step.name()));
                records[idx].cleanup_error = Some(msg);
            }
        }

        info!(state = ?terminal, "pipeline finished");
        self.publish(terminal);

        RunReport { state: terminal, error, steps: records }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::cancel::{Cancellation, CancellationSource};
    use crate::state::StateBag;
    use crate::ui::RecordingUi;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Run(String),
        Cleanup(String),
    }

    type Journal = Arc<Mutex<Vec<Event>>>;

    enum Action {
        Continue,
        Halt(&'static str),
        Panic,
        CancelThenContinue(Arc<CancellationSource>),
        CancelThenHalt(Arc<CancellationSource>),
    }

    struct Recorder {
        name: String,
        action: Action,
        policy: CleanupPolicy,
        fail_cleanup: bool,
        journal: Journal,
    }

    impl Recorder {
        fn new(name: &str, action: Action, journal: &Journal) -> Self {
            Self {
                name: name.to_owned(),
                action,
                policy: CleanupPolicy::OnFailure,
                fail_cleanup: false,
                journal: journal.clone(),
            }
        }

        fn always(mut self) -> Self {
            self.policy = CleanupPolicy::Always;
            self
        }

        fn failing_cleanup(mut self) -> Self {
            self.fail_cleanup = true;
            self
        }
    }

    #[async_trait]
    impl Step<StateBag> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn cleanup_policy(&self) -> CleanupPolicy {
            self.policy
        }

        async fn run(
            &self,
            _ctx: &StepContext,
            _state: &mut StateBag,
        ) -> StepOutcome {
            self.journal.lock().unwrap().push(Event::Run(self.name.clone()));
            match &self.action {
                Action::Continue => StepOutcome::Continue,
                Action::Halt(msg) => StepOutcome::Halt(anyhow!(*msg)),
                Action::Panic => panic!("step exploded"),
                Action::CancelThenContinue(source) => {
                    source.cancel();
                    StepOutcome::Continue
                }
                Action::CancelThenHalt(source) => {
                    source.cancel();
                    StepOutcome::Halt(anyhow!("interrupted"))
                }
            }
        }

        async fn cleanup(
            &self,
            _ctx: &StepContext,
            _state: &mut StateBag,
        ) -> anyhow::Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(Event::Cleanup(self.name.clone()));
            if self.fail_cleanup {
                anyhow::bail!("could not clean up {}", self.name);
            }
            Ok(())
        }
    }

    fn ctx() -> StepContext {
        StepContext::new(
            "test",
            Arc::new(RecordingUi::new()),
            Cancellation::never(),
        )
    }

    fn run(name: &str) -> Event {
        Event::Run(name.to_owned())
    }

    fn cleanup(name: &str) -> Event {
        Event::Cleanup(name.to_owned())
    }

    #[tokio::test]
    async fn halt_unwinds_in_reverse_including_halting_step() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(Recorder::new("b", Action::Halt("boom"), &journal)),
            Box::new(Recorder::new("c", Action::Continue, &journal)),
        ];
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx(), &mut bag).await;

        assert_eq!(report.state, RunState::Halted(1));
        assert_eq!(report.failed_step(), Some("b"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![run("a"), run("b"), cleanup("b"), cleanup("a")]
        );
        assert_eq!(report.error.unwrap().to_string(), "boom");
        assert_eq!(bag.error_message(), Some("boom"));
        assert!(bag.is_halted());
        assert!(!bag.is_cancelled());
        assert_eq!(report.steps[2].status, StepStatus::NotRun);
        assert!(!report.steps[2].cleaned_up);
    }

    #[tokio::test]
    async fn abort_on_error_skips_cleanup() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal).always()),
            Box::new(Recorder::new("b", Action::Halt("boom"), &journal)),
        ];
        let mut bag = StateBag::new();
        let report = Runner::new(steps)
            .with_on_error(OnError::Abort)
            .run(&ctx(), &mut bag)
            .await;

        assert_eq!(report.state, RunState::Halted(1));
        assert_eq!(*journal.lock().unwrap(), vec![run("a"), run("b")]);
        assert!(report.steps.iter().all(|r| !r.cleaned_up));
        assert_eq!(bag.error_message(), Some("boom"));
    }

    #[tokio::test]
    async fn completion_only_cleans_up_always_steps() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal).always()),
            Box::new(Recorder::new("b", Action::Continue, &journal)),
            Box::new(Recorder::new("c", Action::Continue, &journal).always()),
        ];
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx(), &mut bag).await;

        assert!(report.is_success());
        assert!(report.error.is_none());
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                run("a"),
                run("b"),
                run("c"),
                cleanup("c"),
                cleanup("a")
            ]
        );
        assert!(bag.error_message().is_none());
    }

    #[tokio::test]
    async fn failing_cleanup_does_not_stop_unwind_or_replace_error() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(
                Recorder::new("b", Action::Continue, &journal)
                    .failing_cleanup(),
            ),
            Box::new(Recorder::new("c", Action::Halt("boom"), &journal)),
        ];
        let ui = Arc::new(RecordingUi::new());
        let ctx = StepContext::new("test", ui.clone(), Cancellation::never());
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx, &mut bag).await;

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                run("a"),
                run("b"),
                run("c"),
                cleanup("c"),
                cleanup("b"),
                cleanup("a")
            ]
        );
        assert_eq!(bag.error_message(), Some("boom"));
        assert_eq!(
            report.steps[1].cleanup_error.as_deref(),
            Some("could not clean up b")
        );
        assert!(ui.contains("Cleanup of b failed"));
    }

    #[tokio::test]
    async fn panicking_step_halts_and_unwinds() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(Recorder::new("b", Action::Panic, &journal)),
        ];
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx(), &mut bag).await;

        assert_eq!(report.state, RunState::Halted(1));
        assert!(report
            .error
            .unwrap()
            .to_string()
            .contains("step b panicked: step exploded"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![run("a"), run("b"), cleanup("b"), cleanup("a")]
        );
    }

    #[tokio::test]
    async fn cancellation_is_noticed_at_next_step_boundary() {
        let journal = Journal::default();
        let source = Arc::new(CancellationSource::new());
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(Recorder::new(
                "b",
                Action::CancelThenContinue(source.clone()),
                &journal,
            )),
            Box::new(Recorder::new("c", Action::Continue, &journal)),
        ];
        let ctx = StepContext::new(
            "test",
            Arc::new(RecordingUi::new()),
            source.token(),
        );
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx, &mut bag).await;

        assert_eq!(report.state, RunState::Cancelled(2));
        assert!(bag.is_cancelled());
        assert!(!bag.is_halted());
        assert!(report.error.unwrap().downcast_ref::<Cancelled>().is_some());
        assert_eq!(
            *journal.lock().unwrap(),
            vec![run("a"), run("b"), cleanup("b"), cleanup("a")]
        );
    }

    #[tokio::test]
    async fn step_halting_on_cancellation_is_cancelled_not_halted() {
        let journal = Journal::default();
        let source = Arc::new(CancellationSource::new());
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(Recorder::new(
                "b",
                Action::CancelThenHalt(source.clone()),
                &journal,
            )),
        ];
        let ctx = StepContext::new(
            "test",
            Arc::new(RecordingUi::new()),
            source.token(),
        );
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx, &mut bag).await;

        assert_eq!(report.state, RunState::Cancelled(1));
        assert_eq!(bag.error_message(), Some("interrupted"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![run("a"), run("b"), cleanup("b"), cleanup("a")]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let journal = Journal::default();
        let source = CancellationSource::new();
        source.cancel();
        let steps: Vec<Box<dyn Step<StateBag>>> =
            vec![Box::new(Recorder::new("a", Action::Continue, &journal))];
        let ctx = StepContext::new(
            "test",
            Arc::new(RecordingUi::new()),
            source.token(),
        );
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx, &mut bag).await;

        assert_eq!(report.state, RunState::Cancelled(0));
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_hook_sees_every_step_and_state_is_published() {
        let journal = Journal::default();
        let paused = Arc::new(Mutex::new(Vec::new()));
        let hook_paused = paused.clone();
        let hook: PauseHook = Arc::new(move |name: &str| {
            hook_paused.lock().unwrap().push(name.to_owned());
            async {}.boxed()
        });
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![
            Box::new(Recorder::new("a", Action::Continue, &journal)),
            Box::new(Recorder::new("b", Action::Continue, &journal)),
        ];
        let runner = Runner::new(steps).with_pause_hook(hook);
        let state_rx = runner.subscribe();
        assert_eq!(*state_rx.borrow(), RunState::NotStarted);

        let mut bag = StateBag::new();
        runner.run(&ctx(), &mut bag).await;

        assert_eq!(*paused.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(*state_rx.borrow(), RunState::Completed);
    }

    /// Step `a` writes x=1, `b` reads it and writes y=x+1, `c` checks y.
    struct Arith(&'static str);

    #[async_trait]
    impl Step<StateBag> for Arith {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(
            &self,
            _ctx: &StepContext,
            state: &mut StateBag,
        ) -> StepOutcome {
            let res = (|| -> anyhow::Result<()> {
                match self.0 {
                    "a" => state.put("x", 1i64),
                    "b" => {
                        let x: i64 = state.get_as("x")?;
                        state.put("y", x + 1);
                    }
                    _ => {
                        let _: i64 = state.get_as("y")?;
                    }
                }
                Ok(())
            })();
            res.into()
        }
    }

    #[tokio::test]
    async fn values_flow_between_steps() {
        let steps: Vec<Box<dyn Step<StateBag>>> =
            vec![Box::new(Arith("a")), Box::new(Arith("b")), Box::new(Arith("c"))];
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx(), &mut bag).await;

        assert!(report.is_success());
        assert_eq!(bag.get_as::<i64>("x").unwrap(), 1);
        assert_eq!(bag.get_as::<i64>("y").unwrap(), 2);
        assert!(bag.get_ok("error").is_none());
    }

    #[tokio::test]
    async fn reading_unset_key_halts_with_missing_key() {
        let steps: Vec<Box<dyn Step<StateBag>>> = vec![Box::new(Arith("b"))];
        let mut bag = StateBag::new();
        let report = Runner::new(steps).run(&ctx(), &mut bag).await;

        assert_eq!(report.state, RunState::Halted(0));
        let err = report.error.unwrap();
        assert!(matches!(
            err.downcast_ref::<crate::StateError>(),
            Some(crate::StateError::MissingKey(k)) if k == "x"
        ));
    }

    fn run_pipeline(
        n: usize,
        halt_at: Option<usize>,
    ) -> (RunReport, Vec<Event>) {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step<StateBag>>> = (0..n)
            .map(|i| {
                let action = if Some(i) == halt_at {
                    Action::Halt("halt")
                } else {
                    Action::Continue
                };
                Box::new(Recorder::new(&format!("s{i}"), action, &journal))
                    as Box<dyn Step<StateBag>>
            })
            .collect();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut bag = StateBag::new();
        let report = rt.block_on(Runner::new(steps).run(&ctx(), &mut bag));
        let events = journal.lock().unwrap().clone();
        (report, events)
    }

    proptest! {
        #[test]
        fn halting_step_k_cleans_up_k_down_to_zero(
            (n, k) in (1usize..12).prop_flat_map(|n| (Just(n), 0..n))
        ) {
            let (report, events) = run_pipeline(n, Some(k));
            prop_assert_eq!(report.state, RunState::Halted(k));

            let mut expected: Vec<Event> =
                (0..=k).map(|i| run(&format!("s{i}"))).collect();
            expected.extend((0..=k).rev().map(|i| cleanup(&format!("s{i}"))));
            prop_assert_eq!(events, expected);
        }

        #[test]
        fn completed_pipeline_runs_each_step_once_in_order(n in 0usize..12) {
            let (report, events) = run_pipeline(n, None);
            prop_assert_eq!(report.state, RunState::Completed);
            let expected: Vec<Event> =
                (0..n).map(|i| run(&format!("s{i}"))).collect();
            prop_assert_eq!(events, expected);
        }
    }
}
