/// SQL DDL for the dialog store.
/// WAL mode + busy timeout applied at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS dialogs (
    root_id TEXT NOT NULL,
    self_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    assignment TEXT,
    task_doc TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (root_id, self_id)
);

CREATE TABLE IF NOT EXISTS dialog_latest (
    root_id TEXT NOT NULL,
    self_id TEXT NOT NULL,
    current_course INTEGER NOT NULL DEFAULT 1,
    last_genseq INTEGER NOT NULL DEFAULT 0,
    run_state TEXT NOT NULL,
    diligence_remaining INTEGER NOT NULL DEFAULT 0,
    needs_drive INTEGER NOT NULL DEFAULT 0,
    up_next TEXT,
    context_health TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (root_id, self_id)
);

CREATE TABLE IF NOT EXISTS course_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id TEXT NOT NULL,
    self_id TEXT NOT NULL,
    course INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reminders (
    root_id TEXT NOT NULL,
    self_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    items TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (root_id, self_id)
);

CREATE TABLE IF NOT EXISTS q4h (
    question_id TEXT PRIMARY KEY,
    root_id TEXT NOT NULL,
    self_id TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_subdialogs (
    root_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    call_id TEXT NOT NULL,
    subdialog_id TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (root_id, owner_id, call_id)
);

CREATE TABLE IF NOT EXISTS subdialog_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    call_id TEXT NOT NULL,
    record TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued'
);

CREATE TABLE IF NOT EXISTS subdialog_sessions (
    root_id TEXT NOT NULL,
    session_key TEXT NOT NULL,
    self_id TEXT NOT NULL,
    PRIMARY KEY (root_id, session_key)
);

CREATE INDEX IF NOT EXISTS idx_latest_needs_drive ON dialog_latest(needs_drive);
CREATE INDEX IF NOT EXISTS idx_course_events_dialog ON course_events(root_id, self_id, course);
CREATE INDEX IF NOT EXISTS idx_q4h_dialog ON q4h(root_id, self_id);
CREATE INDEX IF NOT EXISTS idx_pending_target ON pending_subdialogs(root_id, subdialog_id);
CREATE INDEX IF NOT EXISTS idx_responses_owner ON subdialog_responses(root_id, owner_id, state);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
