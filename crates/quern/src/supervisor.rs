//! Worker supervision: spawn N loops, relay shutdown signals, escalate to
//! abort after a grace period.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::StoreResult;
use crate::worker::WorkerLoop;

const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Runs a pool of worker loops until they finish or shutdown is requested.
///
/// The shutdown token is sticky: once cancelled it stays cancelled, and every
/// loop observes it at its next polling tick. Loops get `grace` to finish the
/// job they are running; whatever is still alive after that is aborted.
pub struct Supervisor {
    shutdown: CancellationToken,
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            grace,
        }
    }

    /// Token handed to each [`WorkerLoop`] and to anything else that should
    /// stop with the pool.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install a background task that cancels the shutdown token on SIGINT
    /// or SIGTERM.
    pub fn spawn_signal_listener(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received, workers exit after their current job");
            token.cancel();
        });
    }

    /// Run the given loops to completion.
    pub async fn run(self, workers: Vec<WorkerLoop>) -> anyhow::Result<()> {
        let count = workers.len();
        info!(workers = count, "supervisor starting");

        let mut pool: JoinSet<StoreResult<()>> = JoinSet::new();
        for worker in workers {
            pool.spawn(worker.run());
        }

        let cancelled = self.shutdown.cancelled();
        tokio::pin!(cancelled);
        let interrupted = tokio::select! {
            _ = drain(&mut pool) => false,
            _ = &mut cancelled => true,
        };

        if interrupted && tokio::time::timeout(self.grace, drain(&mut pool)).await.is_err() {
            warn!(
                grace_secs = self.grace.as_secs(),
                "grace period elapsed, aborting remaining workers"
            );
            pool.abort_all();
            drain(&mut pool).await;
        }

        info!("supervisor stopped");
        Ok(())
    }
}

async fn drain(pool: &mut JoinSet<StoreResult<()>>) {
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            // A store failure kills that worker; the rest keep running and
            // the operator decides whether to restart.
            Ok(Err(err)) => error!(error = %err, "worker terminated on store error"),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => error!(error = %join_err, "worker task panicked"),
        }
    }
}

/// Resolve when SIGINT or, on unix, SIGTERM arrives.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
