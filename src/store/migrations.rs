//! Forward-only schema migrations, applied in order at open time.
//!
//! Each entry is a batch of `;`-separated `CREATE TABLE IF NOT EXISTS`
//! statements. New migrations are appended to the end of this list; existing
//! entries are never edited once released, matching the store's "monotonic
//! list of forward-only statements" contract.

pub const MIGRATIONS: &[&str] = &[MIGRATION_001_INIT];

const MIGRATION_001_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL DEFAULT 'generic',
    pid INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    last_heartbeat_at TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    current_task_id TEXT,
    capabilities_json TEXT NOT NULL DEFAULT '[]',
    role TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    session_key TEXT
);

CREATE TABLE IF NOT EXISTS leader (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    agent_id TEXT NOT NULL,
    term INTEGER NOT NULL,
    lease_expires_at TEXT NOT NULL,
    elected_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 5,
    created_by TEXT,
    claimed_by TEXT,
    claim_term INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    claimed_at TEXT,
    completed_at TEXT,
    result TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    tags_json TEXT NOT NULL DEFAULT '[]',
    context_json TEXT NOT NULL DEFAULT '{}',
    version INTEGER NOT NULL DEFAULT 1,
    is_checkpoint INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
    ON tasks (status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);

CREATE INDEX IF NOT EXISTS idx_task_dependencies_depends_on
    ON task_dependencies (depends_on);

CREATE TABLE IF NOT EXISTS file_locks (
    path TEXT PRIMARY KEY,
    owner_agent_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_agent TEXT NOT NULL,
    to_agent TEXT,
    content TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'chat',
    created_at TEXT NOT NULL,
    read_at TEXT,
    reply_to INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_to_agent_read
    ON messages (to_agent, read_at);
CREATE INDEX IF NOT EXISTS idx_messages_reply_to
    ON messages (reply_to);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    type TEXT NOT NULL,
    agent_id TEXT,
    task_id TEXT,
    detail_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
