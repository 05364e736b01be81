use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use dominds_core::ids::DialogId;

/// `severity` orders levels so "at least WARN" is `severity <= 1`.
const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS dialog_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        severity INTEGER NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        root_id TEXT,
        dialog_id TEXT,
        agent_id TEXT,
        genseq INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_dialog_logs_tree ON dialog_logs(root_id, id);
    CREATE INDEX IF NOT EXISTS idx_dialog_logs_dialog ON dialog_logs(dialog_id, id);";

const COLUMNS: &str = "id, logged_at, severity, target, message, fields, dialog_id, agent_id, genseq";

/// Most severe first; a level's index is its `severity`.
const LEVELS: [Level; 5] = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];

fn severity(level: Level) -> i64 {
    LEVELS.iter().position(|l| *l == level).unwrap_or(LEVELS.len() - 1) as i64
}

fn level_of(severity: i64) -> Level {
    usize::try_from(severity)
        .ok()
        .and_then(|i| LEVELS.get(i).copied())
        .unwrap_or(Level::TRACE)
}

/// Which dialog an event belongs to, gathered from the event and the spans
/// around it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DialogTags {
    pub dialog_id: Option<String>,
    pub agent_id: Option<String>,
    pub genseq: Option<u64>,
}

impl DialogTags {
    fn is_complete(&self) -> bool {
        self.dialog_id.is_some() && self.agent_id.is_some() && self.genseq.is_some()
    }

    fn is_empty(&self) -> bool {
        self.dialog_id.is_none() && self.agent_id.is_none() && self.genseq.is_none()
    }

    /// Fill whatever is still unknown from an enclosing span.
    fn inherit(&mut self, outer: &DialogTags) {
        if self.dialog_id.is_none() {
            self.dialog_id.clone_from(&outer.dialog_id);
        }
        if self.agent_id.is_none() {
            self.agent_id.clone_from(&outer.agent_id);
        }
        self.genseq = self.genseq.or(outer.genseq);
    }

    /// Tree of the tagged dialog. Unparsable ids keep no tree.
    fn root_id(&self) -> Option<String> {
        self.dialog_id
            .as_deref()
            .and_then(|raw| raw.parse::<DialogId>().ok())
            .map(|id| id.root_id)
    }
}

/// One persisted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DialogLogEntry {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<Value>,
    pub dialog_id: Option<String>,
    pub agent_id: Option<String>,
    pub genseq: Option<u64>,
}

impl DialogLogEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let fields: Option<String> = row.get(5)?;
        let genseq: Option<i64> = row.get(8)?;
        Ok(Self {
            id: row.get(0)?,
            logged_at: row.get(1)?,
            level: level_of(row.get(2)?).to_string(),
            target: row.get(3)?,
            message: row.get(4)?,
            fields: fields.and_then(|raw| serde_json::from_str(&raw).ok()),
            dialog_id: row.get(6)?,
            agent_id: row.get(7)?,
            genseq: genseq.map(|g| g as u64),
        })
    }
}

/// Filter for [`DialogLogSink::query`]. Empty matches everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Least severe level to include.
    pub min_level: Option<Level>,
    /// Every dialog of one tree.
    pub root_id: Option<String>,
    /// Exactly one dialog, in `root#sub` form for subdialogs.
    pub dialog_id: Option<String>,
    pub agent_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    pub fn tree(root_id: impl Into<String>) -> Self {
        Self {
            root_id: Some(root_id.into()),
            ..Self::default()
        }
    }

    pub fn dialog(id: &DialogId) -> Self {
        Self {
            dialog_id: Some(id.to_string()),
            ..Self::default()
        }
    }

    fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(level) = self.min_level {
            clauses.push("severity <= ?");
            params.push(Box::new(severity(level)));
        }
        let columns = [
            ("root_id = ?", &self.root_id),
            ("dialog_id = ?", &self.dialog_id),
            ("agent_id = ?", &self.agent_id),
            ("logged_at >= ?", &self.since),
        ];
        for (clause, value) in columns {
            if let Some(value) = value {
                clauses.push(clause);
                params.push(Box::new(value.clone()));
            }
        }
        let mut sql = format!("SELECT {COLUMNS} FROM dialog_logs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", self.limit.unwrap_or(100)));
        (sql, params)
    }
}

/// SQLite store of engine events, keyed by the dialog they concern.
pub struct DialogLogSink {
    conn: Mutex<Connection>,
}

impl DialogLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, level: Level, target: &str, message: &str, fields: &Map<String, Value>, tags: &DialogTags) {
        let fields = if fields.is_empty() {
            None
        } else {
            serde_json::to_string(fields).ok()
        };
        // Logging never fails the caller.
        let _ = self.conn.lock().execute(
            "INSERT INTO dialog_logs
             (logged_at, severity, target, message, fields, root_id, dialog_id, agent_id, genseq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                severity(level),
                target,
                message,
                fields,
                tags.root_id(),
                tags.dialog_id,
                tags.agent_id,
                tags.genseq.map(|g| g as i64),
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<DialogLogEntry>, rusqlite::Error> {
        let (sql, params) = q.to_sql();
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(refs.as_slice(), DialogLogEntry::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM dialog_logs", [], |row| row.get(0))
    }
}

/// Splits an event's fields into dialog tags and everything else.
#[derive(Default)]
struct TagVisitor {
    message: Option<String>,
    tags: DialogTags,
    fields: Map<String, Value>,
}

impl TagVisitor {
    fn text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "dialog_id" => self.tags.dialog_id = Some(value),
            "agent_id" => self.tags.agent_id = Some(value),
            other => {
                self.fields.insert(other.to_string(), Value::String(value));
            }
        }
    }

    fn number(&mut self, name: &str, value: Value) {
        if name == "genseq" {
            self.tags.genseq = value.as_u64();
        } else {
            self.fields.insert(name.to_string(), value);
        }
    }
}

impl Visit for TagVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.number(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.number(field.name(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}

/// tracing layer feeding a [`DialogLogSink`]. Spans that carry dialog tags
/// (the driver's `drive` span, for one) pass them to the events inside.
pub struct DialogLogLayer {
    sink: Arc<DialogLogSink>,
    min_level: Level,
}

impl DialogLogLayer {
    /// Persists warn and error events.
    pub fn new(sink: Arc<DialogLogSink>) -> Self {
        Self {
            sink,
            min_level: Level::WARN,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl<S> Layer<S> for DialogLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut visitor = TagVisitor::default();
        event.record(&mut visitor);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.tags.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<DialogTags>() {
                    visitor.tags.inherit(outer);
                }
            }
        }

        self.sink.record(
            level,
            event.metadata().target(),
            visitor.message.as_deref().unwrap_or_default(),
            &visitor.fields,
            &visitor.tags,
        );
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = TagVisitor::default();
        attrs.record(&mut visitor);
        if visitor.tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.tags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn tagged(dialog: &str, agent: &str) -> DialogTags {
        DialogTags {
            dialog_id: Some(dialog.into()),
            agent_id: Some(agent.into()),
            genseq: None,
        }
    }

    fn with_layer<F: FnOnce()>(layer: DialogLogLayer, f: F) {
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DialogLogSink::new(&dir.path().join("nested/logs.db")).unwrap();
        sink.record(Level::WARN, "t", "m", &Map::new(), &DialogTags::default());
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn tree_query_spans_root_and_subdialogs() {
        let sink = DialogLogSink::in_memory().unwrap();
        let none = Map::new();
        sink.record(Level::WARN, "driver", "root stalled", &none, &tagged("r1", "lead"));
        sink.record(Level::ERROR, "queues", "sub failed", &none, &tagged("r1#s1", "pangu"));
        sink.record(Level::WARN, "driver", "other tree", &none, &tagged("r2", "lead"));
        sink.record(Level::WARN, "revival", "untagged", &none, &DialogTags::default());

        let tree: Vec<_> = sink
            .query(&LogQuery::tree("r1"))
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(tree, vec!["sub failed", "root stalled"]);

        let sub = sink.query(&LogQuery::dialog(&DialogId::sub("r1", "s1"))).unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].agent_id.as_deref(), Some("pangu"));
        assert_eq!(sub[0].level, "ERROR");

        let errors = sink
            .query(&LogQuery {
                min_level: Some(Level::ERROR),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(sink.query(&LogQuery::default()).unwrap().len(), 4);
    }

    #[test]
    fn limit_returns_newest_first() {
        let sink = DialogLogSink::in_memory().unwrap();
        for i in 0..10 {
            sink.record(Level::WARN, "t", &format!("msg {i}"), &Map::new(), &tagged("r", "lead"));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..LogQuery::tree("r")
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn events_inherit_tags_from_the_drive_span() {
        let sink = Arc::new(DialogLogSink::in_memory().unwrap());
        with_layer(DialogLogLayer::new(sink.clone()), || {
            let span = tracing::info_span!("drive", dialog_id = "root1#sub1", agent_id = "pangu");
            let _enter = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(genseq = 3u64, attempt = 2u64, "generator retry");
        });

        let rows = sink.query(&LogQuery::tree("root1")).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.message, "generator retry");
        assert_eq!(row.dialog_id.as_deref(), Some("root1#sub1"));
        assert_eq!(row.agent_id.as_deref(), Some("pangu"));
        assert_eq!(row.genseq, Some(3));
        assert_eq!(row.fields.as_ref().unwrap()["attempt"], 2);
    }

    #[test]
    fn event_tags_win_over_span_tags() {
        let sink = Arc::new(DialogLogSink::in_memory().unwrap());
        with_layer(DialogLogLayer::new(sink.clone()), || {
            let span = tracing::info_span!("sweep", dialog_id = "outer", agent_id = "lead");
            let _enter = span.enter();
            tracing::error!(dialog_id = "inner#s2", "drive failed");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].dialog_id.as_deref(), Some("inner#s2"));
        assert_eq!(rows[0].agent_id.as_deref(), Some("lead"));
        assert_eq!(sink.query(&LogQuery::tree("inner")).unwrap().len(), 1);
    }

    #[test]
    fn min_level_is_adjustable() {
        let sink = Arc::new(DialogLogSink::in_memory().unwrap());
        with_layer(DialogLogLayer::new(sink.clone()).with_min_level(Level::INFO), || {
            tracing::info!(dialog_id = "r", "drive finished");
            tracing::debug!(dialog_id = "r", "too chatty");
        });
        let rows = sink.query(&LogQuery::tree("r")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, "INFO");
    }
}
