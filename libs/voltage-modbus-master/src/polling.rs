//! Periodic polling
//!
//! [`PollingScheduler`] repeats an async operation on a fixed interval in a
//! spawned task. Each tick awaits the operation before the next tick may
//! fire, and ticks missed while an operation overran are skipped rather than
//! bunched up. `stop` cancels the task and waits for it to exit; an
//! operation already in flight is allowed to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{ModbusClient, ReadRequest};
use crate::codec::ModbusValue;
use crate::error::{MasterError, Result};

struct PollingJob {
    token: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl PollingJob {
    async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("Poll task ended abnormally: {}", e);
        }
        info!("Polling stopped ({:?} interval)", self.interval);
    }
}

/// Owner of at most one polling loop
#[derive(Default)]
pub struct PollingScheduler {
    job: Mutex<Option<PollingJob>>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start repeating `operation` every `interval`, first run one interval from now
    ///
    /// A job already running is fully stopped before the new one starts.
    pub async fn start<F, Fut>(&self, interval: Duration, operation: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(MasterError::invalid_input("polling interval must be positive"));
        }

        let mut job = self.job.lock().await;
        if let Some(previous) = job.take() {
            previous.shutdown().await;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(interval, operation, token.clone()));
        *job = Some(PollingJob {
            token,
            handle,
            interval,
        });
        info!("Polling started: {:?}", interval);
        Ok(())
    }

    /// Poll `request` on `client`, handing every outcome to `handler`
    pub async fn start_read<H>(
        &self,
        interval: Duration,
        client: Arc<ModbusClient>,
        request: ReadRequest,
        handler: H,
    ) -> Result<()>
    where
        H: Fn(Result<ModbusValue>) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.start(interval, move || {
            let client = Arc::clone(&client);
            let handler = Arc::clone(&handler);
            async move { handler(client.read(&request).await) }
        })
        .await
    }

    /// Cancel the running job and wait until its task has exited
    ///
    /// No-op when nothing is running.
    pub async fn stop(&self) {
        let previous = self.job.lock().await.take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.job
            .lock()
            .await
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(job) = self.job.get_mut().take() {
            job.token.cancel();
        }
    }
}

async fn run_loop<F, Fut>(period: Duration, mut operation: F, token: CancellationToken)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Poll loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                operation().await;
            }
        }
    }
}
