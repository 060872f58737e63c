//! Fixed-size worker pool. Workers pull dispatched firings off a shared
//! queue, run the job body, and report back to the dispatcher.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::job::{BoundCall, JobContext, RunId};

/// One firing handed to the pool.
#[derive(Debug)]
pub(crate) struct Work {
    /// Index of the job in the dispatcher's table.
    pub slot: usize,
    pub call: BoundCall,
    pub ctx: JobContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(String),
    Panicked(String),
}

/// Sent back to the dispatcher when a worker finishes a firing.
#[derive(Debug)]
pub(crate) struct Completion {
    pub slot: usize,
    pub run_id: RunId,
    pub outcome: Outcome,
}

pub(crate) struct WorkerPool {
    work_tx: mpsc::UnboundedSender<Work>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(size: usize, completions: mpsc::UnboundedSender<Completion>) -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(work_rx));
        let workers = (0..size)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    Arc::clone(&queue),
                    completions.clone(),
                ))
            })
            .collect();
        Self { work_tx, workers }
    }

    /// Queue a firing. Hands the work back if the pool has stopped.
    pub(crate) fn submit(&self, work: Work) -> Result<(), Work> {
        self.work_tx.send(work).map_err(|e| e.0)
    }

    /// Close the queue and wait for the workers to finish what they hold.
    pub(crate) async fn stop(self) {
        drop(self.work_tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }

    /// Stop the workers immediately, abandoning running job bodies.
    pub(crate) fn abort(self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Work>>>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(work) = next else {
            debug!(worker = index, "work queue closed; worker exiting");
            break;
        };
        let slot = work.slot;
        let run_id = work.ctx.run_id;
        let outcome = execute(work).await;
        if completions
            .send(Completion {
                slot,
                run_id,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Run one job body. Errors and panics stop here.
async fn execute(work: Work) -> Outcome {
    let Work { call, ctx, .. } = work;
    let job = ctx.job.clone();
    let run_id = ctx.run_id;

    let result = AssertUnwindSafe(async move { call.invoke(ctx).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(e)) => {
            let detail = format!("{e:#}");
            error!(job = %job, run_id = %run_id, error = %detail, "job execution failed");
            Outcome::Failed(detail)
        }
        Err(payload) => {
            let detail = panic_message(payload.as_ref());
            error!(job = %job, run_id = %run_id, panic = %detail, "job panicked");
            Outcome::Panicked(detail)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
