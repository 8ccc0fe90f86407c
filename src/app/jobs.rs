use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

type JobFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Background tasks running concurrently with the servers.
///
/// Each job receives a cancellation handle signalled at shutdown and runs
/// inside a span carrying its name. Stop waits for all jobs under the
/// shutdown deadline; overrunning jobs are reported, not killed.
pub struct JobScheduler {
    jobs: Vec<(String, JobFn)>,
    handles: Vec<(String, tokio::task::JoinHandle<()>)>,
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            cancel,
        }
    }

    pub fn add<F, Fut>(&mut self, name: &str, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.jobs
            .push((name.to_string(), Box::new(move |token| Box::pin(job(token)))));
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len() + self.handles.len()
    }

    /// Launch every registered job in its own task.
    pub fn start(&mut self) {
        for (name, job) in self.jobs.drain(..) {
            let token = self.cancel.child_token();
            let span = tracing::info_span!("job", name = %name);
            let fut = job(token);
            let handle = tokio::spawn(
                async move {
                    info!("job started");
                    match fut.await {
                        Ok(()) => info!("job finished"),
                        Err(e) => error!("job failed: {:#}", e),
                    }
                }
                .instrument(span),
            );
            self.handles.push((name, handle));
        }
    }

    /// Signal cancellation and wait for all jobs, bounded by `timeout`.
    /// On overrun the remaining jobs keep running detached.
    pub async fn stop(&mut self, timeout: Duration) -> anyhow::Result<()> {
        self.cancel.cancel();
        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return Ok(());
        }

        let count = handles.len();
        let join_all = async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    error!("job {} panicked: {}", name, e);
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("jobs: all {} stopped", count);
                Ok(())
            }
            Err(_) => anyhow::bail!(
                "jobs did not stop within {}s (left running detached)",
                timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_observe_cancellation() {
        let mut scheduler = JobScheduler::new(CancellationToken::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        scheduler.add("waiter", move |token| async move {
            token.cancelled().await;
            let _ = tx.send(());
            Ok(())
        });
        scheduler.start();

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn stop_times_out_on_stuck_job() {
        let mut scheduler = JobScheduler::new(CancellationToken::new());
        scheduler.add("stuck", |_token| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        scheduler.start();

        let result = scheduler.stop(Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_with_no_jobs_is_immediate() {
        let mut scheduler = JobScheduler::new(CancellationToken::new());
        scheduler.start();
        scheduler.stop(Duration::from_millis(1)).await.unwrap();
    }
}
