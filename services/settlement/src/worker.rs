//! Settlement worker pool
//!
//! Accepts withdrawal orders on a bounded queue and runs each through the
//! pipeline on its own task, with at most `concurrency` in progress. Chain
//! writes are serialized by the gateway regardless of pool size; risk
//! evaluation and confirmation polling run in parallel.
//!
//! Shutdown cancels confirmation polling. Each task has already persisted its
//! request as `Submitted` with the transaction hash before polling starts,
//! so `resume_in_flight` after a restart picks the polling back up.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::ids::WithdrawId;
use types::withdrawal::{WithdrawOrder, WithdrawRequest};

use crate::pipeline::{PipelineError, WithdrawalPipeline};

pub type Outcome = Result<WithdrawRequest, PipelineError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Settlement worker is shut down")]
    Closed,

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Withdrawals in progress at once
    pub concurrency: usize,
    /// Orders waiting for a slot before `submit` applies backpressure
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 1024,
        }
    }
}

enum Work {
    Process(WithdrawOrder),
    Resume(WithdrawId),
}

struct Job {
    work: Work,
    reply: Option<oneshot::Sender<Outcome>>,
}

pub struct SettlementWorker {
    intake: mpsc::Sender<Job>,
    pipeline: Arc<WithdrawalPipeline>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SettlementWorker {
    /// Start the pool. Cancelling the pipeline's shutdown token stops it.
    pub fn spawn(pipeline: Arc<WithdrawalPipeline>, config: WorkerConfig) -> Self {
        let (intake, queue) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = pipeline.shutdown_token().clone();
        let task = tokio::spawn(run(
            Arc::clone(&pipeline),
            queue,
            config.concurrency.max(1),
            shutdown.clone(),
        ));
        info!(
            concurrency = config.concurrency,
            queue_capacity = config.queue_capacity,
            "Settlement worker started"
        );
        Self {
            intake,
            pipeline,
            shutdown,
            task,
        }
    }

    /// Queue an order. The receiver yields the request's final state.
    pub async fn submit(&self, order: WithdrawOrder) -> Result<oneshot::Receiver<Outcome>, WorkerError> {
        self.enqueue(Work::Process(order)).await
    }

    /// Queue every request a previous run left unfinished. Returns how many.
    pub async fn resume_in_flight(&self) -> Result<usize, WorkerError> {
        let ids = self.pipeline.in_flight().await?;
        for id in &ids {
            self.intake
                .send(Job {
                    work: Work::Resume(*id),
                    reply: None,
                })
                .await
                .map_err(|_| WorkerError::Closed)?;
        }
        info!(count = ids.len(), "Resumed in-flight withdrawals");
        Ok(ids.len())
    }

    /// Cancel polling, stop intake and wait for running tasks to return.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.intake);
        if let Err(err) = self.task.await {
            error!(error = %err, "Settlement worker task failed");
        }
        info!("Settlement worker stopped");
    }

    async fn enqueue(&self, work: Work) -> Result<oneshot::Receiver<Outcome>, WorkerError> {
        let (reply, outcome) = oneshot::channel();
        self.intake
            .send(Job {
                work,
                reply: Some(reply),
            })
            .await
            .map_err(|_| WorkerError::Closed)?;
        Ok(outcome)
    }
}

async fn run(
    pipeline: Arc<WithdrawalPipeline>,
    mut queue: mpsc::Receiver<Job>,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            job = queue.recv() => {
                let Some(job) = job else { break };
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let pipeline = Arc::clone(&pipeline);
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = match job.work {
                        Work::Process(order) => pipeline.process(order).await,
                        Work::Resume(id) => pipeline.resume(id).await,
                    };
                    match &outcome {
                        Ok(request) => {
                            debug!(withdraw_id = %request.id, status = %request.status, "Withdrawal settled")
                        }
                        Err(PipelineError::Cancelled(id)) => {
                            info!(withdraw_id = %id, "Polling stopped for shutdown")
                        }
                        Err(err) => warn!(error = %err, "Withdrawal did not complete"),
                    }
                    if let Some(reply) = job.reply {
                        let _ = reply.send(outcome);
                    }
                });
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "Settlement task panicked");
    }
}
