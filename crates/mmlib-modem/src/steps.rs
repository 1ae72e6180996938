//! Step state machines for multi-command operations.
//!
//! Operations such as enabling a GPS engine are a fixed list of steps, some
//! of which are skipped depending on probed features, some of which are
//! retried, and some of which must run as cleanup even after an earlier
//! step failed. A [`StepMachine`] describes the steps; [`run_steps`] drives
//! it, sleeping between steps, checking cancellation at every boundary and
//! making sure a saved error wins over anything that happens afterwards.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mmlib_core::error::{Error, Result};

/// What to do after a step ran.
#[derive(Debug)]
pub enum Transition<S, T> {
    /// Move to `step` once `after` has elapsed.
    Next { step: S, after: Duration },
    /// Run the current step again once `after` has elapsed.
    Retry { after: Duration },
    /// Save `error` (unless one is saved already) and continue at `step`.
    Cleanup { step: S, error: Error },
    /// Stop with an error.
    Fail(Error),
    /// Stop with a result.
    Done(T),
}

impl<S, T> Transition<S, T> {
    /// Move to `step` without waiting.
    pub fn next(step: S) -> Self {
        Transition::Next {
            step,
            after: Duration::ZERO,
        }
    }
}

/// Per-run state handed to every step.
#[derive(Debug)]
pub struct SequenceContext<S> {
    step: S,
    attempt: u32,
    saved_error: Option<Error>,
    cancel: CancellationToken,
}

impl<S: Copy + Debug> SequenceContext<S> {
    fn new(step: S, cancel: CancellationToken) -> Self {
        SequenceContext {
            step,
            attempt: 0,
            saved_error: None,
            cancel,
        }
    }

    pub fn step(&self) -> S {
        self.step
    }

    /// Zero on the first run of a step, incremented on each retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn saved_error(&self) -> Option<&Error> {
        self.saved_error.as_ref()
    }

    /// Keep `error` for the final result. Only the first saved error is kept;
    /// later ones are logged.
    pub fn save_error(&mut self, error: Error) {
        match &self.saved_error {
            None => self.saved_error = Some(error),
            Some(saved) => {
                debug!(step = ?self.step, %error, %saved, "error after saved error");
            }
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn goto(&mut self, step: S) {
        self.step = step;
        self.attempt = 0;
    }
}

/// A multi-step operation.
#[async_trait]
pub trait StepMachine: Send {
    type Step: Copy + Debug + Send + Sync;
    type Output: Send;

    fn first_step(&self) -> Self::Step;

    /// Run `ctx.step()` and decide what comes next.
    async fn run_step(
        &mut self,
        ctx: &mut SequenceContext<Self::Step>,
    ) -> Transition<Self::Step, Self::Output>;
}

/// Drive `machine` to completion.
///
/// The result is delivered exactly once: a saved error takes precedence
/// over both `Done` and a later `Fail`. Cancellation is checked before
/// every step and interrupts any pending delay.
pub async fn run_steps<M: StepMachine>(mut machine: M, cancel: CancellationToken) -> Result<M::Output> {
    let mut ctx = SequenceContext::new(machine.first_step(), cancel);

    loop {
        if ctx.is_cancelled() {
            debug!(step = ?ctx.step, "sequence cancelled");
            return Err(Error::Cancelled);
        }

        match machine.run_step(&mut ctx).await {
            Transition::Next { step, after } => {
                sleep(&ctx.cancel, after).await?;
                ctx.goto(step);
            }
            Transition::Retry { after } => {
                ctx.attempt += 1;
                debug!(step = ?ctx.step, attempt = ctx.attempt, "retrying step");
                sleep(&ctx.cancel, after).await?;
            }
            Transition::Cleanup { step, error } => {
                debug!(from = ?ctx.step, to = ?step, %error, "step failed, running cleanup");
                ctx.save_error(error);
                ctx.goto(step);
            }
            Transition::Fail(error) => {
                return Err(match ctx.saved_error.take() {
                    Some(saved) => {
                        warn!(step = ?ctx.step, %error, "step failed during cleanup");
                        saved
                    }
                    None => error,
                });
            }
            Transition::Done(output) => {
                return match ctx.saved_error.take() {
                    Some(saved) => Err(saved),
                    None => Ok(output),
                };
            }
        }
    }
}

async fn sleep(cancel: &CancellationToken, after: Duration) -> Result<()> {
    if after.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(after) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Prepare,
        Work,
        Cleanup,
        Last,
    }

    /// Scripted machine: each step pops the next transition it should take.
    struct Scripted {
        script: Vec<Transition<Step, &'static str>>,
    }

    #[async_trait]
    impl StepMachine for Scripted {
        type Step = Step;
        type Output = &'static str;

        fn first_step(&self) -> Step {
            Step::Prepare
        }

        async fn run_step(&mut self, _ctx: &mut SequenceContext<Step>) -> Transition<Step, &'static str> {
            self.script.remove(0)
        }
    }

    fn scripted(script: Vec<Transition<Step, &'static str>>) -> Scripted {
        Scripted { script }
    }

    #[tokio::test]
    async fn runs_to_done() {
        let machine = scripted(vec![
            Transition::next(Step::Work),
            Transition::next(Step::Last),
            Transition::Done("ok"),
        ]);
        assert_eq!(run_steps(machine, CancellationToken::new()).await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_counts_attempts_and_waits() {
        struct Flaky;

        #[async_trait]
        impl StepMachine for Flaky {
            type Step = Step;
            type Output = u32;

            fn first_step(&self) -> Step {
                Step::Work
            }

            async fn run_step(&mut self, ctx: &mut SequenceContext<Step>) -> Transition<Step, u32> {
                if ctx.attempt() < 2 {
                    Transition::Retry {
                        after: Duration::from_secs(2),
                    }
                } else {
                    Transition::Done(ctx.attempt())
                }
            }
        }

        let start = Instant::now();
        let result = run_steps(Flaky, CancellationToken::new()).await;
        assert_eq!(result.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn attempt_resets_on_step_change() {
        struct Machine {
            seen: Vec<(Step, u32)>,
        }

        #[async_trait]
        impl StepMachine for Machine {
            type Step = Step;
            type Output = Vec<(Step, u32)>;

            fn first_step(&self) -> Step {
                Step::Work
            }

            async fn run_step(&mut self, ctx: &mut SequenceContext<Step>) -> Transition<Step, Self::Output> {
                self.seen.push((ctx.step(), ctx.attempt()));
                match (ctx.step(), ctx.attempt()) {
                    (Step::Work, 0) => Transition::Retry { after: Duration::ZERO },
                    (Step::Work, _) => Transition::next(Step::Last),
                    _ => Transition::Done(std::mem::take(&mut self.seen)),
                }
            }
        }

        let seen = run_steps(Machine { seen: Vec::new() }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(seen, [(Step::Work, 0), (Step::Work, 1), (Step::Last, 0)]);
    }

    #[tokio::test]
    async fn saved_error_survives_successful_cleanup() {
        let machine = scripted(vec![
            Transition::Cleanup {
                step: Step::Cleanup,
                error: Error::mobile(767),
            },
            Transition::next(Step::Last),
            Transition::Done("ok"),
        ]);
        let err = run_steps(machine, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_protocol_code(767));
    }

    #[tokio::test]
    async fn saved_error_survives_failing_cleanup() {
        let machine = scripted(vec![
            Transition::next(Step::Work),
            Transition::Cleanup {
                step: Step::Cleanup,
                error: Error::mobile(767),
            },
            Transition::Fail(Error::Timeout),
        ]);
        let err = run_steps(machine, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_protocol_code(767));
    }

    #[tokio::test]
    async fn first_saved_error_wins() {
        let machine = scripted(vec![
            Transition::Cleanup {
                step: Step::Work,
                error: Error::mobile(3),
            },
            Transition::Cleanup {
                step: Step::Cleanup,
                error: Error::mobile(4),
            },
            Transition::Done("ok"),
        ]);
        let err = run_steps(machine, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_protocol_code(3));
    }

    #[tokio::test]
    async fn fail_without_saved_error() {
        let machine = scripted(vec![Transition::Fail(Error::Timeout)]);
        assert!(matches!(
            run_steps(machine, CancellationToken::new()).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn cancelled_before_first_step() {
        let token = CancellationToken::new();
        token.cancel();
        let machine = scripted(Vec::new());
        assert!(matches!(run_steps(machine, token).await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_delay() {
        let token = CancellationToken::new();
        let machine = scripted(vec![Transition::Next {
            step: Step::Work,
            after: Duration::from_secs(60),
        }]);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(matches!(run_steps(machine, token).await, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
