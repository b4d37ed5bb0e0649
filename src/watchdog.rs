//! Connectivity supervisor for long-running steps that need the network.
//!
//! The supervised future is dropped as soon as a probe fails.  Work that
//! owns a child process spawned with `kill_on_drop` therefore has that
//! child killed; nothing else is shared between the two.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("connectivity to {0} lost")]
pub struct ConnectivityLost(pub String);

/// Drives `work` to completion unless `probe` (a `host:port`) becomes
/// unreachable first. Without a probe this is just `work.await`.
pub async fn supervise<F, T>(
    work: F,
    probe: Option<&str>,
    interval: Duration,
) -> Result<T, ConnectivityLost>
where
    F: Future<Output = T>,
{
    let Some(addr) = probe else {
        return Ok(work.await);
    };
    tokio::pin!(work);
    tokio::select! {
        out = &mut work => Ok(out),
        _ = watch(addr, interval) => {
            warn!("Lost connectivity to {}; aborting", addr);
            Err(ConnectivityLost(addr.to_string()))
        }
    }
}

/// Returns once `addr` stops accepting connections.
async fn watch(addr: &str, interval: Duration) {
    loop {
        sleep(interval).await;
        if !reachable(addr).await {
            return;
        }
        debug!("{} reachable", addr);
    }
}

async fn reachable(addr: &str) -> bool {
    matches!(timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_no_probe_runs_to_completion() {
        let out = supervise(async { 7 }, None, Duration::from_millis(10)).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_reachable_probe_lets_work_finish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let work = async {
            sleep(Duration::from_millis(200)).await;
            "built"
        };
        let out = supervise(work, Some(&addr), Duration::from_millis(20)).await;
        assert_eq!(out.unwrap(), "built");
    }

    #[tokio::test]
    async fn test_lost_connectivity_aborts_work() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let work = async {
            sleep(Duration::from_secs(30)).await;
            "built"
        };
        let err = supervise(work, Some(&addr), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.0, addr);
    }
}
