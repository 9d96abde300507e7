//! TCP liveness probing with bounded exponential backoff

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait until `host:port` accepts a TCP connection, retrying with
/// exponential backoff until `deadline` elapses.
///
/// Returns `false` when the deadline elapsed without a successful connect.
pub async fn wait_tcp(host: &str, port: u16, deadline: Duration) -> bool {
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => {
                tracing::trace!(host = %host, port = port, error = %e, "liveness probe failed");
            }
            Err(_) => {
                tracing::trace!(host = %host, port = port, "liveness probe timed out");
            }
        }

        if start.elapsed() + backoff > deadline {
            return false;
        }
        sleep(backoff).await;
        backoff = std::cmp::min(backoff.saturating_mul(2), MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_tcp_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(wait_tcp("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_tcp_deadline() {
        // Bind a listener to reserve a port, then drop it so nothing accepts
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let start = std::time::Instant::now();
        assert!(!wait_tcp("127.0.0.1", port, Duration::from_millis(300)).await);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_wait_tcp_late_listener() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            // Keep accepting until the test ends
            loop {
                let _ = listener.accept().await;
            }
        });

        assert!(wait_tcp("127.0.0.1", port, Duration::from_secs(5)).await);
    }
}
