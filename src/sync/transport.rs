//! Outbound push transport.
//!
//! The trait seam keeps the outbox logic testable without a network: tests
//! script a fake transport, production uses `reqwest` behind a short-lived
//! tokio runtime (the single async operation in the engine).

/// Result of one push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    /// 2xx from the remote.
    Accepted,
    /// Non-2xx HTTP status. 4xx is non-retryable, 5xx is retryable.
    Rejected(u16),
    /// Network-level failure (DNS, connect, timeout). Retryable.
    TransportError(String),
}

impl PushResult {
    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Accepted => false,
            Self::Rejected(status) => *status >= 500,
            Self::TransportError(_) => true,
        }
    }

    /// Short description for `last_error` bookkeeping.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Accepted => "accepted".to_string(),
            Self::Rejected(status) => format!("HTTP {status}"),
            Self::TransportError(e) => e.clone(),
        }
    }
}

/// One outbound push to the remote collaborator.
pub trait SyncTransport {
    /// Issue a single push attempt. Never panics; all failure modes are
    /// folded into the returned [`PushResult`].
    fn push(
        &self,
        endpoint: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> PushResult;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: std::time::Duration::from_secs(10),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for HttpTransport {
    fn push(
        &self,
        endpoint: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> PushResult {
        let Ok(rt) = tokio::runtime::Runtime::new() else {
            return PushResult::TransportError("failed to start async runtime".to_string());
        };

        rt.block_on(async {
            let mut request = self
                .client
                .post(endpoint)
                .timeout(self.timeout)
                .json(body);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        PushResult::Accepted
                    } else {
                        PushResult::Rejected(status.as_u16())
                    }
                }
                Err(e) => PushResult::TransportError(e.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(!PushResult::Accepted.is_retryable());
        assert!(!PushResult::Rejected(400).is_retryable());
        assert!(!PushResult::Rejected(422).is_retryable());
        assert!(PushResult::Rejected(500).is_retryable());
        assert!(PushResult::Rejected(503).is_retryable());
        assert!(PushResult::TransportError("conn refused".into()).is_retryable());
    }

    #[test]
    fn test_describe() {
        assert_eq!(PushResult::Rejected(503).describe(), "HTTP 503");
    }
}
