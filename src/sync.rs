//! SyncEngine - batched outbound synchronization of pending sessions.
//!
//! Each pass picks up to one batch of unsynced sessions, bundles them with
//! their failures, and POSTs the bundle to the remote endpoint. Sessions are
//! marked synced only after the endpoint acknowledges the whole batch, so a
//! failed or interrupted pass leaves every session pending for the next run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::store::{Failure, Session, SessionStore};

/// Maximum sessions per outbound batch. Bounds the request payload size.
pub const SYNC_BATCH_SIZE: usize = 50;

#[derive(Debug, Serialize)]
pub struct SyncMetadata {
    pub client_version: String,
    pub timestamp: String,
}

/// One session with its related failures attached.
#[derive(Debug, Serialize)]
pub struct SessionEntry {
    #[serde(flatten)]
    pub session: Session,
    pub failures: Vec<Failure>,
}

/// The outbound request body: assembly metadata plus one entry per session.
#[derive(Debug, Serialize)]
pub struct SyncPayload {
    pub metadata: SyncMetadata,
    pub payload: Vec<SessionEntry>,
}

/// Outcome of a single `run_sync` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The batch was transmitted and acknowledged; all of its sessions are
    /// now marked synced.
    Completed { sessions: usize },
    /// Transport or storage failure. No sync flag was flipped; the same
    /// sessions are picked up again on the next pass.
    TransmissionFailed { reason: String },
    /// Nothing pending. No network call was made.
    NoPendingWork,
    /// Another pass holds the in-flight permit. Nothing was read or sent.
    AlreadyRunning,
}

/// Transport seam for the outbound sync request. The production
/// implementation POSTs JSON over HTTP; tests substitute in-process fakes.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Deliver one payload. `Ok(())` means the remote endpoint acknowledged
    /// the whole batch; any error means the batch is unconfirmed.
    async fn send(&self, payload: &SyncPayload) -> anyhow::Result<()>;
}

/// HTTP transport: a single POST per batch, JSON body.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// A request that outlives the timeout is treated the same as a
    /// non-success response: the batch stays unconfirmed.
    pub fn new(endpoint: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, payload: &SyncPayload) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(status = %status, "Sync endpoint rejected batch: {}", snippet);
            anyhow::bail!("sync endpoint returned {}", status);
        }

        Ok(())
    }
}

/// Moves pending sessions to the remote endpoint in bounded batches.
///
/// At most one pass runs at a time per engine; overlapping `run_sync` calls
/// coalesce into the running one. Delivery is at-least-once: an acknowledgment
/// lost after the server commits leaves the batch pending locally, and the
/// next pass resends it.
pub struct SyncEngine {
    store: Arc<SessionStore>,
    transport: Arc<dyn SyncTransport>,
    in_flight: tokio::sync::Semaphore,
}

impl SyncEngine {
    pub fn new(store: Arc<SessionStore>, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            store,
            transport,
            in_flight: tokio::sync::Semaphore::new(1),
        }
    }

    /// Run one sync pass. Never panics and never propagates errors to the
    /// caller; sync is a background concern and failures only show up in the
    /// returned outcome and the logs.
    pub async fn run_sync(&self) -> SyncOutcome {
        // The permit is dropped on every exit path below, so a failed pass
        // can never leave the engine stuck busy.
        let _permit = match self.in_flight.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                info!("Sync already in flight, skipping");
                return SyncOutcome::AlreadyRunning;
            }
        };

        match self.sync_batch().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Sync pass failed: {}", e);
                SyncOutcome::TransmissionFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn sync_batch(&self) -> anyhow::Result<SyncOutcome> {
        let pending = self.store.query_pending_sessions(SYNC_BATCH_SIZE).await?;
        if pending.is_empty() {
            return Ok(SyncOutcome::NoPendingWork);
        }

        // The batch is fixed here: the IDs transmitted and the IDs marked
        // synced below are exactly this set.
        let session_ids: Vec<i64> = pending.iter().map(|s| s.id).collect();
        let failures = self.store.query_failures_for_sessions(&session_ids).await?;

        let payload = build_payload(pending, &failures);

        if let Err(e) = self.transport.send(&payload).await {
            warn!(
                sessions = session_ids.len(),
                "Sync transmission failed, batch stays pending: {}", e
            );
            return Ok(SyncOutcome::TransmissionFailed {
                reason: e.to_string(),
            });
        }

        // Acknowledged: flip the whole batch in one statement.
        self.store.mark_synced(&session_ids).await?;

        info!(sessions = session_ids.len(), "Sync batch confirmed");
        Ok(SyncOutcome::Completed {
            sessions: session_ids.len(),
        })
    }
}

fn build_payload(sessions: Vec<Session>, failures: &[Failure]) -> SyncPayload {
    let entries: Vec<SessionEntry> = sessions
        .into_iter()
        .map(|session| SessionEntry {
            failures: failures
                .iter()
                .filter(|f| f.session_id == session.id)
                .cloned()
                .collect(),
            session,
        })
        .collect();

    SyncPayload {
        metadata: SyncMetadata {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        },
        payload: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Severity;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    async fn create_test_store() -> Arc<SessionStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Arc::new(SessionStore::new(pool).await.unwrap())
    }

    /// Records every payload it is handed; optionally rejects all batches.
    struct RecordingTransport {
        calls: AtomicUsize,
        last_payload: Mutex<Option<serde_json::Value>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_payload: Mutex::new(None),
                fail,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_payload(&self) -> serde_json::Value {
            self.last_payload.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl SyncTransport for RecordingTransport {
        async fn send(&self, payload: &SyncPayload) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock().unwrap() = Some(serde_json::to_value(payload)?);
            if self.fail {
                anyhow::bail!("sync endpoint returned 500 Internal Server Error");
            }
            Ok(())
        }
    }

    /// Blocks inside `send` until released, so a test can hold a pass open.
    struct BlockingTransport {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncTransport for BlockingTransport {
        async fn send(&self, _payload: &SyncPayload) -> anyhow::Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_pass_marks_batch_and_attaches_failures() {
        let store = create_test_store().await;
        let transport = RecordingTransport::new(false);
        let engine = SyncEngine::new(Arc::clone(&store), transport.clone());

        let now = Utc::now();
        let s1 = store.record_session(now).await.unwrap();
        let s2 = store
            .record_session(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let s3 = store
            .record_session(now + chrono::Duration::seconds(2))
            .await
            .unwrap();

        store
            .record_failure(s1, "boyle's law", Severity::Minor, now)
            .await
            .unwrap();
        store
            .record_failure(s1, "charles's law", Severity::Major, now)
            .await
            .unwrap();
        store
            .record_failure(s3, "oxidation states", Severity::Critical, now)
            .await
            .unwrap();

        let outcome = engine.run_sync().await;
        assert_eq!(outcome, SyncOutcome::Completed { sessions: 3 });
        assert!(store.query_pending_sessions(10).await.unwrap().is_empty());

        assert_eq!(transport.call_count(), 1);
        let body = transport.last_payload();
        assert!(body["metadata"]["client_version"].is_string());
        assert!(body["metadata"]["timestamp"].is_string());

        let entries = body["payload"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["id"], s1);
        assert_eq!(entries[0]["failures"].as_array().unwrap().len(), 2);
        assert_eq!(entries[1]["id"], s2);
        assert!(entries[1]["failures"].as_array().unwrap().is_empty());
        assert_eq!(entries[2]["id"], s3);
        assert_eq!(
            entries[2]["failures"][0]["concept"],
            "oxidation states"
        );
    }

    #[tokio::test]
    async fn test_failed_transmission_leaves_whole_batch_pending() {
        let store = create_test_store().await;
        let transport = RecordingTransport::new(true);
        let engine = SyncEngine::new(Arc::clone(&store), transport.clone());

        let now = Utc::now();
        for i in 0..3 {
            store
                .record_session(now + chrono::Duration::seconds(i))
                .await
                .unwrap();
        }

        let outcome = engine.run_sync().await;
        assert!(matches!(outcome, SyncOutcome::TransmissionFailed { .. }));

        // No partial visibility: every session is still pending.
        assert_eq!(store.query_pending_sessions(10).await.unwrap().len(), 3);

        // The permit was released: the next pass runs and reaches the
        // transport again.
        let outcome = engine.run_sync().await;
        assert!(matches!(outcome, SyncOutcome::TransmissionFailed { .. }));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_no_pending_work_makes_no_network_call() {
        let store = create_test_store().await;
        let transport = RecordingTransport::new(false);
        let engine = SyncEngine::new(store, transport.clone());

        assert_eq!(engine.run_sync().await, SyncOutcome::NoPendingWork);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_oldest_first() {
        let store = create_test_store().await;
        let transport = RecordingTransport::new(false);
        let engine = SyncEngine::new(Arc::clone(&store), transport.clone());

        let base = Utc::now();
        for i in 0..60 {
            store
                .record_session(base + chrono::Duration::seconds(i))
                .await
                .unwrap();
        }

        assert_eq!(
            engine.run_sync().await,
            SyncOutcome::Completed { sessions: 50 }
        );

        // The 10 newest sessions are the ones left pending.
        let remaining = store.query_pending_sessions(60).await.unwrap();
        assert_eq!(remaining.len(), 10);
        assert!(remaining
            .iter()
            .all(|s| s.started_at >= base + chrono::Duration::seconds(50)));

        assert_eq!(
            engine.run_sync().await,
            SyncOutcome::Completed { sessions: 10 }
        );
        assert_eq!(engine.run_sync().await, SyncOutcome::NoPendingWork);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_passes_coalesce() {
        let store = create_test_store().await;
        let transport = Arc::new(BlockingTransport {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            transport.clone() as Arc<dyn SyncTransport>,
        ));

        store.record_session(Utc::now()).await.unwrap();

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_sync().await })
        };

        // Wait until the first pass is inside the transport, holding the permit.
        transport.entered.notified().await;

        assert_eq!(engine.run_sync().await, SyncOutcome::AlreadyRunning);

        transport.release.notify_one();
        let outcome = first.await.unwrap();
        assert_eq!(outcome, SyncOutcome::Completed { sessions: 1 });

        // The first pass released the permit on completion.
        assert_eq!(engine.run_sync().await, SyncOutcome::NoPendingWork);
    }
}
