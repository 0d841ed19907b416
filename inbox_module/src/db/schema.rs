pub const INBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    run_after TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_error TEXT,
    parked INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT,
    UNIQUE(kind, key)
);
CREATE INDEX IF NOT EXISTS jobs_parked_idx ON jobs(kind, parked, run_after);

CREATE TABLE IF NOT EXISTS dead_letters (
    job_id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    dead_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS dead_letters_kind_idx ON dead_letters(kind, dead_at);

CREATE TABLE IF NOT EXISTS queue_pointers (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS queue_pointers_kind_idx ON queue_pointers(kind, seq);

CREATE TABLE IF NOT EXISTS queue_enqueue_times (
    kind TEXT NOT NULL,
    job_id INTEGER NOT NULL,
    enqueued_at TEXT NOT NULL,
    PRIMARY KEY (kind, job_id)
);
CREATE INDEX IF NOT EXISTS queue_enqueue_times_age_idx ON queue_enqueue_times(kind, enqueued_at);

CREATE TABLE IF NOT EXISTS raw_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object TEXT NOT NULL,
    entry_id TEXT,
    payload BLOB NOT NULL,
    signature TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    received_at TEXT NOT NULL,
    processed_at TEXT
);
CREATE INDEX IF NOT EXISTS raw_events_received_idx ON raw_events(received_at);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    counterparty_id TEXT NOT NULL,
    external_conversation_id TEXT,
    last_message_id INTEGER,
    last_message_timestamp_ms INTEGER,
    last_message_text TEXT,
    last_message_direction TEXT,
    last_sender_id TEXT,
    last_recipient_id TEXT,
    last_message_at TEXT,
    hydrated_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conversations_pair_idx ON conversations(account_id, counterparty_id);
CREATE INDEX IF NOT EXISTS conversations_external_idx ON conversations(external_conversation_id);

CREATE TABLE IF NOT EXISTS conversation_aliases (
    alias TEXT PRIMARY KEY,
    alias_kind TEXT NOT NULL,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conversation_aliases_target_idx ON conversation_aliases(conversation_id);

CREATE TABLE IF NOT EXISTS legacy_conversations (
    legacy_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    last_message_id INTEGER,
    last_message_timestamp_ms INTEGER,
    last_message_text TEXT,
    last_message_direction TEXT,
    last_sender_id TEXT,
    last_recipient_id TEXT,
    last_message_at TEXT,
    hydrated_at TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_message_id TEXT NOT NULL UNIQUE,
    conversation_id INTEGER REFERENCES conversations(id),
    legacy_conversation_ref TEXT,
    sender_id TEXT,
    recipient_id TEXT,
    direction TEXT NOT NULL,
    timestamp_ms INTEGER,
    text TEXT,
    attachments_json TEXT,
    raw_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_conversation_idx ON messages(conversation_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS messages_legacy_idx ON messages(legacy_conversation_ref);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    kind TEXT NOT NULL,
    external_id TEXT,
    source_url TEXT,
    fetch_status TEXT NOT NULL DEFAULT 'pending',
    storage_path TEXT,
    error TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(message_id, position)
);
CREATE INDEX IF NOT EXISTS attachments_status_idx ON attachments(fetch_status);

CREATE TABLE IF NOT EXISTS shadow_states (
    conversation_id INTEGER PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    last_inbound_timestamp_ms INTEGER,
    next_attempt_at TEXT,
    postpone_count INTEGER NOT NULL DEFAULT 0,
    escalation_reason TEXT,
    last_error TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS shadow_states_due_idx ON shadow_states(status, next_attempt_at);

CREATE TABLE IF NOT EXISTS shadow_replies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    reply_text TEXT NOT NULL,
    model TEXT,
    confidence REAL,
    reason TEXT,
    attempt_no INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS shadow_replies_conversation_idx ON shadow_replies(conversation_id, id);

CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    host TEXT NOT NULL,
    pid INTEGER NOT NULL,
    beat_at TEXT NOT NULL
);
"#;
