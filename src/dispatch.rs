use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Outbound HTTP delivery with bounded retry. A `false` return means the
/// payload is lost for this cycle — never fatal to the process.
pub struct PayloadDispatcher {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl PayloadDispatcher {
    pub fn new(client: reqwest::Client, api_url: String, api_key: String) -> Self {
        Self {
            client,
            api_url,
            api_key,
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    /// Override the retry policy (tests run with millisecond backoffs).
    pub fn with_retry_policy(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// POST `body` as JSON to `{api_url}/{endpoint}`. Auth failures are
    /// terminal — retrying cannot succeed until an operator fixes the key.
    /// Everything else retries with doubling backoff.
    pub async fn send<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> bool {
        let url = format!("{}/{endpoint}", self.api_url);
        let mut delay = self.initial_backoff;

        for attempt in 1..=self.max_attempts {
            match self
                .client
                .post(&url)
                .header("X-API-Key", &self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!("Successfully sent data to {endpoint}");
                    return true;
                }
                Ok(resp)
                    if matches!(
                        resp.status(),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    ) =>
                {
                    error!(
                        "Authentication failed posting to {endpoint} ({}). Check API key.",
                        resp.status()
                    );
                    return false;
                }
                Ok(resp) => {
                    warn!(
                        "HTTP {} posting to {endpoint} (attempt {attempt}/{})",
                        resp.status(),
                        self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "Connection error posting to {endpoint} (attempt {attempt}/{}): {e}",
                        self.max_attempts
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        error!(
            "Failed to send payload to {endpoint} after {} attempts",
            self.max_attempts
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const SERVER_ERROR: &str =
        "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const UNAUTHORIZED: &str =
        "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    /// One scripted response per expected connection; `None` slams the
    /// connection shut so the client sees a transport error.
    async fn spawn_server(responses: Vec<Option<&'static str>>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for resp in responses {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 8192];
                let _ = sock.read(&mut buf).await;
                if let Some(raw) = resp {
                    let _ = sock.write_all(raw.as_bytes()).await;
                }
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn dispatcher(url: String, attempts: u32, backoff_ms: u64) -> PayloadDispatcher {
        PayloadDispatcher::new(reqwest::Client::new(), url, "test-key".into())
            .with_retry_policy(attempts, Duration::from_millis(backoff_ms))
    }

    #[tokio::test]
    async fn retries_with_doubling_backoff_until_success() {
        let (url, hits) = spawn_server(vec![None, None, None, Some(OK)]).await;
        let d = dispatcher(url, 4, 25);

        let started = std::time::Instant::now();
        assert!(d.send("telemetry", &serde_json::json!({"ping": 1})).await);
        // 3 failed attempts before the success, delays 25 + 50 + 100 ms.
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(175));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, hits) = spawn_server(vec![Some(SERVER_ERROR); 3]).await;
        let d = dispatcher(url, 3, 5);

        assert!(!d.send("telemetry", &serde_json::json!({})).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_after_one_attempt() {
        let (url, hits) = spawn_server(vec![Some(UNAUTHORIZED), Some(OK)]).await;
        let d = dispatcher(url, 3, 5);

        assert!(!d.send("telemetry", &serde_json::json!({})).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
