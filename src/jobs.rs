//! Deferred maintenance jobs.
//!
//! Resize work never runs inline with the request that triggered it.
//! Entry points push a job onto an unbounded channel and the embedding
//! server drains it from [`Engine::run_pending_jobs`](crate::Engine::run_pending_jobs)
//! at its own cadence, one bucket split or merge per job step.

use crate::common::FragmentId;

/// Upper bound on job steps drained per `run_pending_jobs` call, so a
/// steadily growing fragment cannot monopolize the caller's thread.
pub(crate) const MAX_JOB_STEPS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Job {
    /// Run one expand or shrink step on the fragment, re-queueing itself
    /// while the load factor remains out of range.
    Resize { fragment: FragmentId },
}
