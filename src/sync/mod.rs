//! Durable cloud sync.
//!
//! One payload is assembled per summarized session and pushed to the remote
//! collaborator. A failed push (retry exhaustion or a non-retryable 4xx)
//! lands the full original payload verbatim in the durable outbox; the
//! queue is drained opportunistically on later invocations. Delivery is
//! at-least-once; the payload carries a content hash so the remote can
//! deduplicate on receipt.

mod transport;

pub use transport::{HttpTransport, PushResult, SyncTransport};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Push attempts per `sync_to_cloud` call.
const MAX_ATTEMPTS: usize = 3;

/// Delay before each retry attempt, increasing.
const RETRY_DELAYS_MS: [u64; 2] = [500, 1500];

/// Outbox items are evicted once retry_count reaches this ceiling.
pub const RETRY_CEILING: i64 = 5;

/// Maximum items replayed per drain.
const DRAIN_BATCH: u32 = 20;

/// Session knowledge bound for the remote, split into independently
/// filterable categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    pub session_id: String,
    pub generated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<serde_json::Value>,
}

impl SyncPayload {
    /// Apply the per-category allow-list. Excluding one category never
    /// aborts the others.
    #[must_use]
    pub fn filtered(&self, config: &EngineConfig) -> Self {
        Self {
            session_id: self.session_id.clone(),
            generated_at: self.generated_at,
            memory: if config.sync.memory { self.memory.clone() } else { None },
            analytics: if config.sync.analytics { self.analytics.clone() } else { None },
            audit: if config.sync.audit { self.audit.clone() } else { None },
        }
    }

    /// Whether any category survived filtering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.analytics.is_none() && self.audit.is_none()
    }
}

/// What `sync_to_cloud` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Sync is unconfigured; nothing to do.
    Disabled,
    /// The remote accepted the payload.
    Delivered,
    /// Delivery failed; the payload now sits in the durable outbox.
    Queued { reason: String },
}

/// Result counters from one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub evicted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Assemble the sync payload for a session from the store.
///
/// # Errors
///
/// Returns an error if a store query fails.
pub fn build_payload(store: &SqliteStorage, session_id: &str) -> Result<SyncPayload> {
    let summary = store.latest_summary(session_id)?;
    let observations = store.session_observations(session_id)?;
    let stats = store.stats()?;
    let session = store.get_session(session_id)?;

    let memory = serde_json::json!({
        "summary": summary,
        "observations": observations,
    });
    let analytics = serde_json::json!({
        "store": stats,
        "observation_count": observations.len(),
    });
    let audit = serde_json::json!({
        "session": session,
    });

    Ok(SyncPayload {
        session_id: session_id.to_string(),
        generated_at: chrono::Utc::now().timestamp_millis(),
        memory: Some(memory),
        analytics: Some(analytics),
        audit: Some(audit),
    })
}

/// SHA256 hex digest used for receipt-side deduplication.
#[must_use]
pub fn content_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Push a payload to the remote, with bounded in-call retries.
///
/// - Disabled/unconfigured sync is a no-op success.
/// - A 4xx response is non-retryable and stops immediately.
/// - 5xx / network errors retry up to [`MAX_ATTEMPTS`] with the fixed
///   delay schedule.
/// - On ultimate failure the FULL ORIGINAL payload (pre-filtering) is
///   enqueued verbatim and the function still returns `Ok`.
///
/// # Errors
///
/// Returns an error only when even the outbox write fails.
pub fn sync_to_cloud(
    store: &SqliteStorage,
    transport: &dyn SyncTransport,
    config: &EngineConfig,
    payload: &SyncPayload,
) -> Result<SyncOutcome> {
    if !config.sync.is_enabled() {
        return Ok(SyncOutcome::Disabled);
    }
    let endpoint = config.sync.endpoint.as_deref().unwrap_or_default();

    let filtered = payload.filtered(config);
    if filtered.is_empty() {
        tracing::debug!("all sync categories filtered out, nothing to push");
        return Ok(SyncOutcome::Delivered);
    }
    let body = serde_json::to_value(&filtered)?;

    let mut last_result = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = RETRY_DELAYS_MS[(attempt - 1).min(RETRY_DELAYS_MS.len() - 1)];
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }

        match transport.push(endpoint, config.sync.token.as_deref(), &body) {
            PushResult::Accepted => return Ok(SyncOutcome::Delivered),
            result => {
                let retryable = result.is_retryable();
                if retryable {
                    tracing::debug!(attempt, result = %result.describe(), "sync push failed, will retry");
                } else {
                    // 4xx: terminal for this attempt, but still queued for
                    // visibility rather than discarded.
                    tracing::warn!(result = %result.describe(), "sync push rejected, queueing");
                }
                last_result = Some(result);
                if !retryable {
                    break;
                }
            }
        }
    }

    let reason = last_result.map_or_else(|| "unknown".to_string(), |r| r.describe());
    let original = serde_json::to_string(payload)?;
    store.enqueue_sync(&original, &content_hash(&original))?;
    Ok(SyncOutcome::Queued { reason })
}

/// Drain the durable outbox: evict poison items first, then replay the
/// remainder oldest-first, one push attempt each.
///
/// # Errors
///
/// Returns an error if a store operation fails.
pub fn drain_sync_queue(
    store: &SqliteStorage,
    transport: &dyn SyncTransport,
    config: &EngineConfig,
) -> Result<DrainStats> {
    let mut stats = DrainStats::default();
    if !config.sync.is_enabled() {
        return Ok(stats);
    }
    let endpoint = config.sync.endpoint.as_deref().unwrap_or_default();

    // Poison eviction: past the ceiling the item is dropped without a
    // resend, a deliberate data-loss trade-off favoring forward progress.
    stats.evicted = store.evict_poisoned(RETRY_CEILING)?;
    if stats.evicted > 0 {
        tracing::warn!(count = stats.evicted, "evicted poison sync items");
    }

    for item in store.oldest_sync_items(DRAIN_BATCH)? {
        let body: serde_json::Value = match serde_json::from_str(&item.payload) {
            Ok(v) => v,
            Err(e) => {
                // Unparseable payloads only age toward eviction.
                store.fail_sync(item.id, &format!("unparseable payload: {e}"))?;
                stats.failed += 1;
                continue;
            }
        };

        match transport.push(endpoint, config.sync.token.as_deref(), &body) {
            PushResult::Accepted => {
                store.ack_sync(item.id)?;
                stats.delivered += 1;
            }
            r => {
                store.fail_sync(item.id, &r.describe())?;
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scripted transport: pops results front-to-back, records every call.
    struct FakeTransport {
        script: RefCell<Vec<PushResult>>,
        calls: RefCell<usize>,
    }

    impl FakeTransport {
        fn new(script: Vec<PushResult>) -> Self {
            Self {
                script: RefCell::new(script),
                calls: RefCell::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.borrow()
        }
    }

    impl SyncTransport for FakeTransport {
        fn push(
            &self,
            _endpoint: &str,
            _token: Option<&str>,
            _body: &serde_json::Value,
        ) -> PushResult {
            *self.calls.borrow_mut() += 1;
            let mut script = self.script.borrow_mut();
            if script.is_empty() {
                PushResult::Accepted
            } else {
                script.remove(0)
            }
        }
    }

    fn enabled_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::for_tests(dir);
        config.sync.endpoint = Some("https://example.test/ingest".to_string());
        config
    }

    fn payload() -> SyncPayload {
        SyncPayload {
            session_id: "s1".to_string(),
            generated_at: 0,
            memory: Some(serde_json::json!({"k": "v"})),
            analytics: Some(serde_json::json!({"n": 1})),
            audit: Some(serde_json::json!({"a": true})),
        }
    }

    #[test]
    fn test_disabled_sync_is_noop_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        let transport = FakeTransport::new(vec![]);

        let outcome = sync_to_cloud(&store, &transport, &config, &payload()).unwrap();
        assert_eq!(outcome, SyncOutcome::Disabled);
        assert_eq!(transport.calls(), 0);
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_success_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        let transport = FakeTransport::new(vec![PushResult::Accepted]);

        let outcome = sync_to_cloud(&store, &transport, &config, &payload()).unwrap();
        assert_eq!(outcome, SyncOutcome::Delivered);
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_http_500_every_attempt_queues_with_zero_retry_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        let transport = FakeTransport::new(vec![
            PushResult::Rejected(500),
            PushResult::Rejected(500),
            PushResult::Rejected(500),
        ]);

        let outcome = sync_to_cloud(&store, &transport, &config, &payload()).unwrap();
        assert_eq!(transport.calls(), MAX_ATTEMPTS);
        assert!(matches!(outcome, SyncOutcome::Queued { .. }));

        let items = store.oldest_sync_items(10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 0);

        // The queued payload is the full original, all categories intact.
        let queued: SyncPayload = serde_json::from_str(&items[0].payload).unwrap();
        assert!(queued.memory.is_some());
        assert!(queued.analytics.is_some());
        assert!(queued.audit.is_some());
    }

    #[test]
    fn test_4xx_short_circuits_but_still_queues() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        let transport = FakeTransport::new(vec![PushResult::Rejected(422)]);

        let outcome = sync_to_cloud(&store, &transport, &config, &payload()).unwrap();
        assert_eq!(transport.calls(), 1, "no retries after a 4xx");
        assert_eq!(
            outcome,
            SyncOutcome::Queued {
                reason: "HTTP 422".to_string()
            }
        );
        assert_eq!(store.outbox_len().unwrap(), 1);
    }

    #[test]
    fn test_category_filter_drops_sections_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = enabled_config(dir.path());
        config.sync.analytics = false;

        let filtered = payload().filtered(&config);
        assert!(filtered.memory.is_some());
        assert!(filtered.analytics.is_none());
        assert!(filtered.audit.is_some());
    }

    #[test]
    fn test_drain_delivers_oldest_first_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        store.enqueue_sync(r#"{"session_id":"a","generated_at":0}"#, "h1").unwrap();
        store.enqueue_sync(r#"{"session_id":"b","generated_at":0}"#, "h2").unwrap();

        let transport = FakeTransport::new(vec![PushResult::Accepted, PushResult::Accepted]);
        let stats = drain_sync_queue(&store, &transport, &config).unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_drain_failure_increments_retry_and_keeps_item() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        store.enqueue_sync(r#"{"session_id":"a","generated_at":0}"#, "h1").unwrap();

        let transport = FakeTransport::new(vec![PushResult::TransportError("refused".into())]);
        let stats = drain_sync_queue(&store, &transport, &config).unwrap();
        assert_eq!(stats.failed, 1);

        let items = store.oldest_sync_items(10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_poison_item_evicted_without_resend() {
        let dir = tempfile::tempdir().unwrap();
        let config = enabled_config(dir.path());
        let store = SqliteStorage::open_memory().unwrap();
        let id = store
            .enqueue_sync(r#"{"session_id":"a","generated_at":0}"#, "h1")
            .unwrap();
        for _ in 0..RETRY_CEILING {
            store.fail_sync(id, "HTTP 503").unwrap();
        }

        let transport = FakeTransport::new(vec![]);
        let stats = drain_sync_queue(&store, &transport, &config).unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(transport.calls(), 0, "evicted item must not be resent");
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }
}
