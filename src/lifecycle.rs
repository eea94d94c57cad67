//! Process lifecycle: one task set under one cancellation token.
//!
//! The endpoint, the initiator, the signal listener and the reporter run
//! side by side. The first task to fail cancels the rest and its error is
//! the one reported; later failures are only logged.

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::LifecycleError;
use crate::initiator::Initiator;
use crate::metrics::{self, Metrics};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type TaskResult = Result<(), LifecycleError>;

/// Run the demo until interrupted or a task fails.
pub async fn run(config: Config) -> TaskResult {
    let shutdown = CancellationToken::new();
    let metrics = Metrics::new();

    let endpoint = Endpoint::bind(
        &config.hostport,
        config.exchange.clone(),
        metrics.clone(),
        config.shutdown_grace,
    )
    .await?;
    let initiator = Initiator::new(endpoint.local_addr(), config.exchange.clone(), metrics.clone())
        .reconnect(config.reconnect);

    let mut tasks = JoinSet::new();
    tasks.spawn(endpoint.run(shutdown.clone()));
    tasks.spawn({
        let cancel = shutdown.clone();
        async move { initiator.run(cancel).await.map_err(LifecycleError::from) }
    });
    tasks.spawn(wait_for_signal(shutdown.clone()));
    if let Some(period) = config.report_interval {
        let cancel = shutdown.clone();
        tasks.spawn(async move {
            metrics::report(metrics, period, cancel).await;
            Ok(())
        });
    }

    supervise(tasks, shutdown).await
}

/// Wait for every task. The first failure cancels `shutdown` and is returned.
pub async fn supervise(mut tasks: JoinSet<TaskResult>, shutdown: CancellationToken) -> TaskResult {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(LifecycleError::Task).and_then(|result| result);
        let Err(e) = result else {
            continue;
        };

        if first_error.is_none() {
            error!(error = %e, "task failed, shutting down");
            shutdown.cancel();
            first_error = Some(e);
        } else {
            debug!(error = %e, "additional task failure during shutdown");
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Cancel `shutdown` on SIGINT (and SIGTERM on unix).
async fn wait_for_signal(shutdown: CancellationToken) -> TaskResult {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        signal = interrupt() => signal.map_err(LifecycleError::Signal)?,
    }
    info!("signal: interrupt signal received");
    shutdown.cancel();
    Ok(())
}

#[cfg(unix)]
async fn interrupt() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn interrupt() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangePolicy, ExchangeSettings, Mode};
    use crate::error::ExchangeError;
    use std::time::Duration;

    fn paced() -> ExchangeSettings {
        ExchangeSettings {
            mode: Mode::Paced,
            policy: ExchangePolicy::Paired,
            interval: Duration::from_millis(25),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_failure_cancels_siblings() {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn({
            let cancel = shutdown.clone();
            async move {
                cancel.cancelled().await;
                Ok(())
            }
        });
        tasks.spawn(async {
            Err(LifecycleError::Exchange(ExchangeError::Status(
                http::StatusCode::BAD_GATEWAY,
            )))
        });
        tasks.spawn({
            let cancel = shutdown.clone();
            async move {
                cancel.cancelled().await;
                Err(LifecycleError::ShutdownTimeout(Duration::from_secs(1)))
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(1), supervise(tasks, shutdown.clone()))
            .await
            .expect("siblings were not cancelled");

        assert!(shutdown.is_cancelled());
        assert!(matches!(
            result,
            Err(LifecycleError::Exchange(ExchangeError::Status(_)))
        ));
    }

    #[tokio::test]
    async fn test_clean_tasks_do_not_cancel() {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async { Ok(()) });

        assert!(supervise(tasks, shutdown.clone()).await.is_ok());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_task_exits_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(wait_for_signal(shutdown).await.is_ok());
    }

    #[tokio::test]
    async fn test_paced_exchange_counts_stay_balanced() {
        let metrics = Metrics::new();
        let shutdown = CancellationToken::new();
        let endpoint = Endpoint::bind("127.0.0.1:0", paced(), metrics.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let initiator = Initiator::new(endpoint.local_addr(), paced(), metrics.clone());

        let mut tasks = JoinSet::new();
        tasks.spawn(endpoint.run(shutdown.clone()));
        tasks.spawn({
            let cancel = shutdown.clone();
            async move { initiator.run(cancel).await.map_err(LifecycleError::from) }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let during = metrics.snapshot();
        assert!(during.pings_sent > 0);
        assert!(during.pongs_sent > 0);
        assert!(during.pings_sent.abs_diff(during.pongs_sent) <= 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), supervise(tasks, shutdown))
            .await
            .expect("tasks outlived the grace period")
            .unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_survives_initiator_disconnect() {
        let metrics = Metrics::new();
        let shutdown = CancellationToken::new();
        let endpoint = Endpoint::bind("127.0.0.1:0", paced(), metrics.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let addr = endpoint.local_addr();
        let server = tokio::spawn(endpoint.run(shutdown.clone()));

        // First initiator is killed mid-stream on its own token.
        let first_cancel = CancellationToken::new();
        let first = Initiator::new(addr, paced(), metrics.clone());
        let first_run = tokio::spawn({
            let cancel = first_cancel.clone();
            async move { first.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        first_cancel.cancel();
        first_run.await.unwrap().unwrap();
        let after_first = metrics.snapshot().pongs_received;
        assert!(after_first > 0);

        // The endpoint sees the departure as a normal end, not a failure.
        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics.snapshot().exchanges_closed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("exchange was not classified as closed by the client");
        assert_eq!(metrics.snapshot().exchanges_failed, 0);

        // The endpoint keeps accepting.
        let second = Initiator::new(addr, paced(), metrics.clone());
        let second_run = tokio::spawn({
            let cancel = shutdown.clone();
            async move { second.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(metrics.snapshot().pongs_received > after_first);

        shutdown.cancel();
        second_run.await.unwrap().unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(metrics.snapshot().exchanges_failed, 0);
    }
}
