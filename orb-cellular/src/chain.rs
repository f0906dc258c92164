//! Ordered execution of asynchronous steps.
//!
//! A [`TaskChain`] runs its steps one at a time. Every step is dispatched on a
//! fresh turn of the runtime (the runner yields before each one), so a step
//! never runs re-entrantly inside the code that queued it.
//!
//! Two policies exist:
//! - [`ChainPolicy::Strict`]: the first failing step aborts the chain and its
//!   error is returned.
//! - [`ChainPolicy::BestEffort`]: failures are logged and collected in the
//!   [`ChainReport`], the remaining steps still run. Used for teardown.
//!
//! A chain can be bound to an [`Epoch`] of its owner. Once the owner
//! invalidates the epoch, the steps that have not been dispatched yet are
//! dropped and the chain resolves with [`CellularError::Aborted`].

use crate::error::{CellularError, Result};
use futures::future::BoxFuture;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task, time};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Strict,
    BestEffort,
}

struct Step<'a> {
    name: &'static str,
    timeout: Option<Duration>,
    run: Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>,
}

/// Outcome of a chain that ran to completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub completed: Vec<&'static str>,
    /// Only ever filled for [`ChainPolicy::BestEffort`] chains.
    pub failed: Vec<(&'static str, CellularError)>,
}

pub struct TaskChain<'a> {
    name: &'static str,
    policy: ChainPolicy,
    steps: VecDeque<Step<'a>>,
    guard: Option<EpochToken>,
}

impl<'a> TaskChain<'a> {
    pub fn strict(name: &'static str) -> Self {
        Self::new(name, ChainPolicy::Strict)
    }

    pub fn best_effort(name: &'static str) -> Self {
        Self::new(name, ChainPolicy::BestEffort)
    }

    fn new(name: &'static str, policy: ChainPolicy) -> Self {
        Self {
            name,
            policy,
            steps: VecDeque::new(),
            guard: None,
        }
    }

    pub fn step<F, Fut>(self, name: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        self.push(name, None, f)
    }

    /// Same as [`TaskChain::step`], but the step fails with
    /// [`CellularError::Timeout`] if it does not resolve within `timeout`.
    pub fn step_with_timeout<F, Fut>(
        self,
        name: &'static str,
        timeout: Duration,
        f: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        self.push(name, Some(timeout), f)
    }

    fn push<F, Fut>(mut self, name: &'static str, timeout: Option<Duration>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        self.steps.push_back(Step {
            name,
            timeout,
            run: Box::new(move || Box::pin(f())),
        });

        self
    }

    pub fn guarded_by(mut self, token: EpochToken) -> Self {
        self.guard = Some(token);
        self
    }

    pub async fn run(mut self) -> Result<ChainReport> {
        let mut report = ChainReport::default();

        while let Some(step) = self.steps.pop_front() {
            task::yield_now().await;

            if let Some(guard) = &self.guard
                && !guard.is_current()
            {
                debug!(
                    chain = self.name,
                    dropped = self.steps.len() + 1,
                    "chain invalidated, dropping remaining steps"
                );
                return Err(CellularError::Aborted);
            }

            debug!(chain = self.name, step = step.name, "dispatching step");

            let fut = (step.run)();
            let res = match step.timeout {
                Some(timeout) => time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(CellularError::Timeout)),
                None => fut.await,
            };

            match (res, self.policy) {
                (Ok(()), _) => report.completed.push(step.name),

                (Err(e), ChainPolicy::Strict) => {
                    warn!(chain = self.name, step = step.name, "step failed: {e}");
                    return Err(e);
                }

                (Err(e), ChainPolicy::BestEffort) => {
                    warn!(
                        chain = self.name,
                        step = step.name,
                        "step failed, continuing: {e}"
                    );
                    report.failed.push((step.name, e));
                }
            }
        }

        Ok(report)
    }
}

/// Generation counter owned by whoever runs chains.
#[derive(Debug, Default, Clone)]
pub struct Epoch(Arc<AtomicU64>);

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> EpochToken {
        EpochToken {
            epoch: self.clone(),
            generation: self.0.load(Ordering::SeqCst),
        }
    }

    /// Invalidates every token handed out so far.
    pub fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct EpochToken {
    epoch: Epoch,
    generation: u64,
}

impl EpochToken {
    pub fn is_current(&self) -> bool {
        self.epoch.0.load(Ordering::SeqCst) == self.generation
    }
}
