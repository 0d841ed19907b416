#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use inbox_module::clock::ManualClock;
use inbox_module::conversations::ConversationDirectory;
use inbox_module::config::{GatewaySettings, DEFAULT_MAX_BODY_BYTES};
use inbox_module::db::Database;
use inbox_module::ingestion::sign;
use inbox_module::jobs::{BrokerError, JobPointer, MemoryBroker, QueueBroker, QueueSettings};
use inbox_module::platform::{CredentialPair, GraphClient, PlatformCredentials, PlatformSettings};
use inbox_module::retry::ContentionPolicy;
use inbox_module::shadow::{DraftError, DraftOutcome, ReplyDrafter, ShadowPolicy};
use inbox_module::worker::{JobHandler, JobWorker, RetryPolicy, WorkerIdentity};
use inbox_module::{Inbox, InboxConfig, JobKind, QueueBackend};

pub const APP_SECRET: &str = "test-app-secret";
pub const ACCOUNT_ID: &str = "17841400000000001";
pub const ACCESS_TOKEN: &str = "page-token";

pub fn start_mockito_server(test_name: &str) -> Option<mockito::ServerGuard> {
    let server = std::panic::catch_unwind(|| mockito::Server::new());
    match server {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!("Skipping {test_name}; unable to start mockito server in this environment.");
            None
        }
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn test_config(dir: &TempDir, api_base: Option<&str>) -> InboxConfig {
    let mut platform = PlatformSettings {
        credentials: PlatformCredentials {
            page: Some(CredentialPair {
                owner_id: ACCOUNT_ID.to_string(),
                access_token: ACCESS_TOKEN.to_string(),
            }),
            user: None,
        },
        requests_per_minute: 0,
        media_root: dir.path().join("media"),
        request_timeout: Duration::from_secs(5),
        ..PlatformSettings::default()
    };
    if let Some(base) = api_base {
        platform.api_base = base.to_string();
    }
    InboxConfig {
        db_path: dir.path().join("inbox.db"),
        queue_backend: QueueBackend::Memory,
        queue: QueueSettings {
            max_attempts: 3,
            dequeue_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            ..QueueSettings::default()
        },
        retry: RetryPolicy::default(),
        contention: ContentionPolicy::default(),
        shadow: ShadowPolicy::default(),
        shadow_poll_interval: Duration::from_millis(10),
        app_secret: Some(APP_SECRET.to_string()),
        accepted_objects: vec!["instagram".to_string(), "page".to_string()],
        gateway: GatewaySettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            verify_token: Some("verify-me".to_string()),
        },
        platform,
        directory_max_pages: 2,
        drafter: None,
    }
}

/// A full inbox over a temp database, an in-process broker and a manual clock.
pub struct TestInbox {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub inbox: Inbox,
}

impl TestInbox {
    pub fn new() -> Self {
        Self::with_api_base(None)
    }

    pub fn with_api_base(api_base: Option<&str>) -> Self {
        Self::build(api_base, Arc::new(MemoryBroker::new()))
    }

    pub fn with_broker(broker: Arc<dyn QueueBroker>) -> Self {
        Self::build(None, broker)
    }

    fn build(api_base: Option<&str>, broker: Arc<dyn QueueBroker>) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, api_base);
        let db = Database::open(config.db_path.clone()).unwrap();
        let clock = ManualClock::new(start_time());
        // The directory only exists when a platform endpoint is given.
        let directory = api_base.map(|_| {
            Arc::new(GraphClient::new(config.platform.clone()).unwrap()) as Arc<dyn ConversationDirectory>
        });
        let inbox = Inbox::assemble(config, db, broker, Arc::new(clock.clone()), directory);
        Self { dir, clock, inbox }
    }

    pub fn media_root(&self) -> PathBuf {
        self.inbox.config.platform.media_root.clone()
    }

    pub fn worker(&self, kind: JobKind, handler: Arc<dyn JobHandler>) -> JobWorker {
        JobWorker::new(
            kind,
            self.inbox.queue.clone(),
            handler,
            self.inbox.heartbeats(),
            WorkerIdentity::current(),
            Arc::new(self.clock.clone()),
            self.inbox.config.retry,
            self.inbox.config.queue.dequeue_timeout,
        )
    }

    pub fn default_worker(&self, kind: JobKind) -> JobWorker {
        let handlers = self.inbox.handlers().unwrap();
        self.worker(kind, Arc::new(handlers))
    }

    pub fn accept_signed(&self, body: &Value) -> inbox_module::ingestion::Accepted {
        let (bytes, signature) = signed(body);
        self.inbox.pipeline.accept(&bytes, Some(&signature)).unwrap()
    }

    pub fn count(&self, table: &str) -> i64 {
        let conn = self.inbox.db.connection().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }
}

pub fn signed(body: &Value) -> (Vec<u8>, String) {
    let bytes = serde_json::to_vec(body).unwrap();
    let signature = sign(&bytes, APP_SECRET);
    (bytes, signature)
}

/// Single inbound message delivery addressed to the test account.
pub fn inbound_webhook(sender: &str, mid: &str, text: &str, timestamp_ms: i64) -> Value {
    json!({
        "object": "instagram",
        "entry": [{
            "id": ACCOUNT_ID,
            "time": timestamp_ms,
            "messaging": [{
                "sender": {"id": sender},
                "recipient": {"id": ACCOUNT_ID},
                "timestamp": timestamp_ms,
                "message": {"mid": mid, "text": text}
            }]
        }]
    })
}

pub fn with_attachment(mut body: Value, url: &str) -> Value {
    body["entry"][0]["messaging"][0]["message"]["attachments"] = json!([
        {"type": "image", "payload": {"url": url}}
    ]);
    body
}

/// Returns scripted outcomes in order, then "no reply".
pub struct ScriptedDrafter {
    outcomes: Mutex<Vec<Result<DraftOutcome, DraftError>>>,
    pub calls: Mutex<Vec<(i64, u32)>>,
}

impl ScriptedDrafter {
    pub fn new(mut outcomes: Vec<Result<DraftOutcome, DraftError>>) -> Self {
        outcomes.reverse();
        Self {
            outcomes: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ReplyDrafter for ScriptedDrafter {
    fn draft(&self, conversation_id: i64, attempt_no: u32) -> Result<DraftOutcome, DraftError> {
        self.calls.lock().unwrap().push((conversation_id, attempt_no));
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Ok(DraftOutcome::NoReply { reason: None }))
    }
}

/// In-process broker whose next push for a kind can be made to fail.
pub struct FlakyBroker {
    inner: MemoryBroker,
    failing: Mutex<Vec<JobKind>>,
}

impl FlakyBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBroker::new(),
            failing: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_push(&self, kind: JobKind) {
        self.failing.lock().unwrap().push(kind);
    }
}

impl QueueBroker for FlakyBroker {
    fn push(&self, pointer: &JobPointer, enqueued_at: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut failing = self.failing.lock().unwrap();
        if let Some(idx) = failing.iter().position(|kind| *kind == pointer.kind) {
            failing.remove(idx);
            return Err(BrokerError::Disconnected(pointer.kind));
        }
        drop(failing);
        self.inner.push(pointer, enqueued_at)
    }

    fn pop(&self, kind: JobKind, timeout: Duration) -> Result<Option<String>, BrokerError> {
        self.inner.pop(kind, timeout)
    }

    fn forget(&self, kind: JobKind, job_id: i64) -> Result<(), BrokerError> {
        self.inner.forget(kind, job_id)
    }

    fn depth(&self, kind: JobKind) -> Result<usize, BrokerError> {
        self.inner.depth(kind)
    }

    fn oldest_enqueued_at(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, BrokerError> {
        self.inner.oldest_enqueued_at(kind)
    }
}
