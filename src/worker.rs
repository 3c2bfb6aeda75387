//! Job acquisition loop
//!
//! ping, claim, judge, repeat. Nothing escapes a cycle: failures are logged
//! and followed by the poll interval, so the worker runs until it is stopped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::domain::Verdict;
use crate::infra::QueueApi;
use crate::judger::Judger;

/// What one cycle ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing was pending
    Idle,
    /// A job ran to its terminal verdict
    Judged { job_id: i64, verdict: Verdict },
}

pub struct Worker {
    api: Arc<dyn QueueApi>,
    judger: Judger,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(api: Arc<dyn QueueApi>, judger: Judger, poll_interval: Duration) -> Self {
        Self {
            api,
            judger,
            poll_interval,
        }
    }

    /// Run cycles forever.
    pub async fn run(&self) {
        info!("Worker started, polling every {:?}", self.poll_interval);
        loop {
            let outcome = self.cycle().await;
            if let Err(e) = &outcome {
                error!("{:#}", e);
            }
            if needs_backoff(&outcome) {
                sleep(self.poll_interval).await;
            }
        }
    }

    /// One liveness check, one claim, and at most one job.
    pub async fn cycle(&self) -> Result<Cycle> {
        self.api.ping().await.context("Liveness check failed")?;

        let Some(job) = self.api.claim_job().await.context("Failed to claim a job")? else {
            debug!("No pending job");
            return Ok(Cycle::Idle);
        };

        info!("Claimed job {}", job.id);
        let verdict = self
            .judger
            .judge(&job)
            .await
            .with_context(|| format!("Job {} abandoned", job.id))?;
        Ok(Cycle::Judged {
            job_id: job.id,
            verdict,
        })
    }
}

/// An empty queue, a failed cycle, and a job that ended in a compile or
/// internal error all wait out the poll interval; any other finished job is
/// followed straight by the next claim.
pub fn needs_backoff(outcome: &Result<Cycle>) -> bool {
    match outcome {
        Ok(Cycle::Idle) | Err(_) => true,
        Ok(Cycle::Judged { verdict, .. }) => {
            matches!(verdict, Verdict::InternalError | Verdict::CompileError)
        }
    }
}
