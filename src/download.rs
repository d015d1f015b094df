//! HTTP downloads with bounded retry.

use crate::error::ContainerError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("cibox/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Worth another attempt: timeouts, resets, server-side errors.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

/// Source of remote bytes. Tests substitute counting fakes.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Fails when no TLS backend can be initialised.
    pub fn new() -> Result<Self, ContainerError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ContainerError::Configuration(format!("cannot set up HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| classify_transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("GET {url} returned {status}");
            return Err(if is_transient_status(status) {
                FetchError::Transient(message)
            } else {
                FetchError::Fatal(message)
            });
        }

        response
            .bytes()
            .map(|body| body.to_vec())
            .map_err(|e| FetchError::Transient(format!("reading body of {url}: {e}")))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_transport(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        return FetchError::Fatal(format!("invalid request for {url}: {err}"));
    }
    FetchError::Transient(format!("GET {url}: {err}"))
}

/// Exponential backoff for transient download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Same attempt ceiling, no sleeping.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Fetches `url`, retrying transient failures per `policy`.
pub fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, ContainerError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match fetcher.fetch(url) {
            Ok(bytes) => {
                debug!(url, attempt, bytes = bytes.len(), "downloaded");
                return Ok(bytes);
            }
            Err(FetchError::Fatal(details)) => {
                return Err(ContainerError::Download {
                    url: url.to_string(),
                    attempts: attempt,
                    details,
                });
            }
            Err(FetchError::Transient(details)) => {
                if attempt < max_attempts {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        url,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient download failure: {details}"
                    );
                    std::thread::sleep(delay);
                }
                last_error = details;
            }
        }
    }

    Err(ContainerError::Download {
        url: url.to_string(),
        attempts: max_attempts,
        details: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Fetcher for Flaky {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(FetchError::Transient("connection reset".into()))
            } else {
                Ok(b"payload".to_vec())
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(6), Duration::from_secs(8));
        assert_eq!(policy.delay_after(40), Duration::from_secs(8));
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let fetcher = Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
        };
        let bytes = fetch_with_retry(&fetcher, "http://x/rootfs", &RetryPolicy::immediate()).unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_gives_up_at_ceiling() {
        let fetcher = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let err = fetch_with_retry(&fetcher, "http://x/rootfs", &RetryPolicy::immediate()).unwrap_err();
        match err {
            ContainerError::Download { attempts, details, .. } => {
                assert_eq!(attempts, 4);
                assert!(details.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_http_client_setup_is_fallible_not_fatal() {
        let fetcher: Result<HttpFetcher, ContainerError> = HttpFetcher::new();
        assert!(fetcher.is_ok());
    }

    #[test]
    fn test_http_success() {
        let mut server = Server::new();
        let _mock = server
            .mock("GET", "/proot-x86_64")
            .with_status(200)
            .with_body("ELF")
            .create();

        let fetcher = HttpFetcher::new().unwrap();
        let bytes = fetcher.fetch(&format!("{}/proot-x86_64", server.url())).unwrap();
        assert_eq!(bytes, b"ELF");
    }

    #[test]
    fn test_http_503_is_transient_and_retried() {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/core.tar.gz")
            .with_status(503)
            .expect(4)
            .create();

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/core.tar.gz", server.url());
        assert!(matches!(fetcher.fetch(&url), Err(FetchError::Transient(_))));

        let err = fetch_with_retry(&fetcher, &url, &RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::immediate()
        })
        .unwrap_err();
        assert!(matches!(err, ContainerError::Download { attempts: 3, .. }));
        mock.assert();
    }

    #[test]
    fn test_http_404_is_fatal_and_not_retried() {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/missing.tar.gz")
            .with_status(404)
            .expect(1)
            .create();

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/missing.tar.gz", server.url());
        let err = fetch_with_retry(&fetcher, &url, &RetryPolicy::immediate()).unwrap_err();
        assert!(matches!(err, ContainerError::Download { attempts: 1, .. }));
        mock.assert();
    }
}
